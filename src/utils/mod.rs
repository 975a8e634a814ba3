//! Common utilities used across the codebase.

pub mod throttle;

pub use throttle::LogThrottler;
