//! # herald-retry
//!
//! Retry schedules and cancellation primitives for herald's notification
//! delivery paths.
//!
//! A delivery attempt is wrapped with [`retry::invoke`], which re-runs the
//! attempt according to a [`retry::Schedule`] and reports a tagged
//! [`retry::Outcome`] instead of propagating the attempt's error.
pub mod cancel;
pub mod retry;
