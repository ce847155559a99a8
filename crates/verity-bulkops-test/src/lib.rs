//! Integration test infrastructure for the Verity bulk operation manager
//!
//! Provides:
//! - An in-memory controller implementing the bulk transport
//! - Test fixtures for common intent patterns
//! - Call-order and stored-state verification helpers
//! - A manager wired to the in-memory controller

mod env;
pub mod fixtures;
mod mock_transport;
mod verification;

pub use env::{init_tracing, manual_config, TestEnv};
pub use fixtures::*;
pub use mock_transport::{CallMethod, MockTransport, Phase, RecordedCall, Reply};
pub use verification::*;
