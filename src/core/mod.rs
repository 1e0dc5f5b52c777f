pub mod errors;

pub use errors::{CoordError, ErrorKind, Result};
