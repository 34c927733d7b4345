pub mod error;

pub use error::{BootError, Result};
