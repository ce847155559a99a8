//! Manager wired to the in-memory controller

use crate::mock_transport::MockTransport;
use crate::verification::CallVerifier;
use std::sync::Arc;
use verity_bulkops::{BulkConfig, BulkOperationManager, Result};

/// A running manager plus the controller it talks to.
pub struct TestEnv {
    pub transport: Arc<MockTransport>,
    pub manager: BulkOperationManager,
}

impl TestEnv {
    /// Default configuration, echoing controller.
    pub fn start() -> Result<Self> {
        Self::with_config(BulkConfig::default())
    }

    pub fn with_config(config: BulkConfig) -> Result<Self> {
        Self::with_transport(config, MockTransport::new())
    }

    pub fn with_transport(config: BulkConfig, transport: MockTransport) -> Result<Self> {
        init_tracing();
        let transport = Arc::new(transport);
        let manager = BulkOperationManager::new(config, transport.clone())?;
        Ok(Self { transport, manager })
    }

    pub fn verifier(&self) -> CallVerifier<'_> {
        CallVerifier::new(&self.transport)
    }
}

/// Configuration where nothing leaves the queues until `flush`.
pub fn manual_config() -> BulkConfig {
    BulkConfig {
        max_batch_age_ms: 3_600_000,
        max_batch_size: 10_000,
        ..BulkConfig::default()
    }
}

/// Routes manager logs through the test harness; `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
