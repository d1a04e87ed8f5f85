//! Cooperative cancellation for delivery work.
//!
//! Re-exported from `tokio_util` so downstream crates track a single token
//! type without depending on `tokio-util` themselves.
pub use tokio_util::sync::CancellationToken;
