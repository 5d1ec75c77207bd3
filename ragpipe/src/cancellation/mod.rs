//! Cooperative cancellation for scheduler runs.

mod token;

pub use token::CancellationToken;
