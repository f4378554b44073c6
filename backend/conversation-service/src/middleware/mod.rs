pub mod error_handling;
pub mod guards;

pub use guards::{InternalCaller, User};
