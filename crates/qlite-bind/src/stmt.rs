//! The prepared-statement surface parameters are bound to.

use qlite_error::{QliteError, Result};

/// Parameter slots of a prepared statement.
///
/// Slots are 1-based. Every `bind_*` call with an index outside
/// `1..=parameter_count()` fails with [`QliteError::Range`]. Text and blob
/// arguments are copied before the call returns.
pub trait Statement {
    fn parameter_count(&self) -> usize;

    /// Reset every slot to unbound.
    fn clear_bindings(&mut self) -> Result<()>;

    fn bind_int64(&mut self, index: usize, value: i64) -> Result<()>;

    fn bind_double(&mut self, index: usize, value: f64) -> Result<()>;

    fn bind_blob(&mut self, index: usize, value: &[u8]) -> Result<()>;

    fn bind_null(&mut self, index: usize) -> Result<()>;

    fn bind_text(&mut self, index: usize, value: &str) -> Result<()>;
}

/// What a slot currently holds.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BoundParam {
    #[default]
    Unbound,
    Int64(i64),
    Double(f64),
    Blob(Vec<u8>),
    Null,
    Text(String),
}

impl BoundParam {
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        !matches!(self, Self::Unbound)
    }
}

/// A [`Statement`] that keeps owned copies of its bindings in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatement {
    slots: Vec<BoundParam>,
}

impl SlotStatement {
    #[must_use]
    pub fn new(parameter_count: usize) -> Self {
        Self {
            slots: vec![BoundParam::Unbound; parameter_count],
        }
    }

    /// Slot `index` (1-based), if it exists.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&BoundParam> {
        index.checked_sub(1).and_then(|i| self.slots.get(i))
    }

    #[must_use]
    pub fn slots(&self) -> &[BoundParam] {
        &self.slots
    }

    /// Number of slots holding a value.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|p| p.is_bound()).count()
    }

    fn set(&mut self, index: usize, param: BoundParam) -> Result<()> {
        let count = self.slots.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(QliteError::Range { index, count })?;
        *slot = param;
        Ok(())
    }
}

impl Statement for SlotStatement {
    fn parameter_count(&self) -> usize {
        self.slots.len()
    }

    fn clear_bindings(&mut self) -> Result<()> {
        self.slots.fill(BoundParam::Unbound);
        Ok(())
    }

    fn bind_int64(&mut self, index: usize, value: i64) -> Result<()> {
        self.set(index, BoundParam::Int64(value))
    }

    fn bind_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.set(index, BoundParam::Double(value))
    }

    fn bind_blob(&mut self, index: usize, value: &[u8]) -> Result<()> {
        self.set(index, BoundParam::Blob(value.to_vec()))
    }

    fn bind_null(&mut self, index: usize) -> Result<()> {
        self.set(index, BoundParam::Null)
    }

    fn bind_text(&mut self, index: usize, value: &str) -> Result<()> {
        self.set(index, BoundParam::Text(value.to_owned()))
    }
}
