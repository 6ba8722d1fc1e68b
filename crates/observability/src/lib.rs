//! Process-wide tracing setup for binaries and tests embedding the engine.

pub mod subscriber;

pub use subscriber::{LogFormat, init, init_with};
