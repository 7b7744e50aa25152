//! Statement parameter binding from the tuple wire format.
//!
//! A client sends statement parameters as a tuple ([`tuple`]). The server
//! decodes the tuple and binds each value to the matching 1-based slot of a
//! prepared [`Statement`] with [`bind_params`].

pub mod bind;
pub mod stmt;
pub mod tuple;

pub use bind::{bind_one, bind_params};
pub use stmt::{BoundParam, SlotStatement, Statement};
pub use tuple::{Cursor, TupleDecoder, TupleEncoder, TupleFormat, TUPLE_WORD};
