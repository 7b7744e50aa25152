use std::fmt;

/// Wire type codes for values carried in tuples.
///
/// The first five are SQLite's fundamental storage classes; the rest are
/// refinements that travel with their own code but are stored as one of the
/// fundamental classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
    Null = 5,
    /// Integer seconds since the Unix epoch. Known on the wire but not
    /// accepted as a parameter.
    UnixTime = 9,
    Iso8601 = 10,
    Boolean = 11,
}

impl ValueType {
    /// Parse a wire type code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Integer),
            2 => Some(Self::Float),
            3 => Some(Self::Text),
            4 => Some(Self::Blob),
            5 => Some(Self::Null),
            9 => Some(Self::UnixTime),
            10 => Some(Self::Iso8601),
            11 => Some(Self::Boolean),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Null => "NULL",
            Self::UnixTime => "UNIXTIME",
            Self::Iso8601 => "ISO8601",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically-typed parameter value.
///
/// `Iso8601` and `Boolean` are semantic refinements: they are stored as
/// text and integer respectively, but keep their own tag so a consumer can
/// tell them apart from plain text and integers.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A binary large object.
    Blob(Vec<u8>),
    /// SQL NULL.
    Null,
    /// A UTF-8 text string.
    Text(String),
    /// An ISO-8601 timestamp carried as text.
    Iso8601(String),
    /// A boolean carried as the integer 0 or 1.
    Boolean(bool),
}

impl Value {
    /// The wire tag of this value.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Integer(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::Blob(_) => ValueType::Blob,
            Self::Null => ValueType::Null,
            Self::Text(_) => ValueType::Text,
            Self::Iso8601(_) => ValueType::Iso8601,
            Self::Boolean(_) => ValueType::Boolean,
        }
    }

    /// The fundamental storage class this value is stored as.
    #[must_use]
    pub const fn storage_type(&self) -> ValueType {
        match self {
            Self::Integer(_) | Self::Boolean(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::Blob(_) => ValueType::Blob,
            Self::Null => ValueType::Null,
            Self::Text(_) | Self::Iso8601(_) => ValueType::Text,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view: integers as-is, booleans as 0/1.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Boolean(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Text view: plain text and ISO-8601 timestamps.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Iso8601(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Blob(b)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Blob(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
            Self::Null => f.write_str("NULL"),
            Self::Text(s) | Self::Iso8601(s) => write!(f, "'{s}'"),
            Self::Boolean(b) => write!(f, "{}", u8::from(*b)),
        }
    }
}
