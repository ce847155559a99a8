//! Verification helpers for bulk operation tests
//!
//! Assertions over what the in-memory controller saw: which bulk calls were
//! made, in what order they ran and what ended up stored.

use crate::mock_transport::{CallMethod, MockTransport, Phase};
use serde_json::Value;
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug, PartialEq)]
pub enum VerificationError {
    #[error("Expected a {method} call for '{kind}', none recorded")]
    CallNotFound { method: &'static str, kind: String },

    #[error("Unexpected {method} call for '{kind}'")]
    UnexpectedCall { method: &'static str, kind: String },

    #[error("Expected {expected} {method} calls for '{kind}', found {actual}")]
    CallCountMismatch {
        method: &'static str,
        kind: String,
        expected: usize,
        actual: usize,
    },

    #[error("Expected '{first}' to complete before '{second}' started")]
    OrderViolation { first: String, second: String },

    #[error("No {method} payload for {kind}:{name}")]
    PayloadNotFound {
        method: &'static str,
        kind: String,
        name: String,
    },

    #[error("Value mismatch for {kind}:{name}: expected {expected}, got {actual}")]
    ValueMismatch {
        kind: String,
        name: String,
        expected: Value,
        actual: Value,
    },

    #[error("Expected {kind}:{name} to be stored")]
    NotStored { kind: String, name: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Call-log verification helper
pub struct CallVerifier<'a> {
    transport: &'a MockTransport,
}

impl<'a> CallVerifier<'a> {
    pub fn new(transport: &'a MockTransport) -> Self {
        Self { transport }
    }

    fn count(&self, method: CallMethod, kind: &str) -> usize {
        self.transport
            .calls()
            .iter()
            .filter(|c| c.method == method && c.kind == kind)
            .count()
    }

    /// At least one call of this method reached the kind.
    pub fn assert_called(&self, method: CallMethod, kind: &str) -> VerifyResult<()> {
        if self.count(method, kind) == 0 {
            return Err(VerificationError::CallNotFound {
                method: method.as_str(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    pub fn assert_not_called(&self, method: CallMethod, kind: &str) -> VerifyResult<()> {
        if self.count(method, kind) > 0 {
            return Err(VerificationError::UnexpectedCall {
                method: method.as_str(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    pub fn assert_call_count(&self, method: CallMethod, kind: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.count(method, kind);
        if actual != expected {
            return Err(VerificationError::CallCountMismatch {
                method: method.as_str(),
                kind: kind.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Every `first` call ended before any `second` call started.
    pub fn assert_completed_before(
        &self,
        first: (CallMethod, &str),
        second: (CallMethod, &str),
    ) -> VerifyResult<()> {
        let calls = self.transport.calls();
        let matches = |index: usize, (method, kind): (CallMethod, &str)| {
            calls
                .get(index)
                .is_some_and(|c| c.method == method && c.kind == kind)
        };
        let label = |(method, kind): (CallMethod, &str)| format!("{} {kind}", method.as_str());

        let events = self.transport.events();
        let last_end = events
            .iter()
            .rposition(|&(phase, i)| phase == Phase::End && matches(i, first));
        let first_start = events
            .iter()
            .position(|&(phase, i)| phase == Phase::Start && matches(i, second));

        match (last_end, first_start) {
            (None, _) => Err(VerificationError::CallNotFound {
                method: first.0.as_str(),
                kind: first.1.to_string(),
            }),
            (_, None) => Err(VerificationError::CallNotFound {
                method: second.0.as_str(),
                kind: second.1.to_string(),
            }),
            (Some(end), Some(start)) if end < start => Ok(()),
            _ => Err(VerificationError::OrderViolation {
                first: label(first),
                second: label(second),
            }),
        }
    }

    /// The last `method` call carrying `name` sent exactly `expected`.
    pub fn assert_payload(
        &self,
        method: CallMethod,
        kind: &str,
        name: &str,
        expected: &Value,
    ) -> VerifyResult<()> {
        let sent = self
            .transport
            .calls()
            .into_iter()
            .rev()
            .filter(|c| c.method == method && c.kind == kind)
            .find_map(|c| {
                c.names
                    .iter()
                    .position(|n| n == name)
                    .and_then(|i| c.payloads.get(i).cloned())
            })
            .ok_or_else(|| VerificationError::PayloadNotFound {
                method: method.as_str(),
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        if &sent != expected {
            return Err(VerificationError::ValueMismatch {
                kind: kind.to_string(),
                name: name.to_string(),
                expected: expected.clone(),
                actual: sent,
            });
        }
        Ok(())
    }

    /// The controller holds `(kind, name)`; its stored fields include `expected`'s.
    pub fn assert_stored(&self, kind: &str, name: &str, expected: &Value) -> VerifyResult<()> {
        let stored = self
            .transport
            .object(kind, name)
            .ok_or_else(|| VerificationError::NotStored {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        let contains = match (expected.as_object(), stored.as_object()) {
            (Some(want), Some(have)) => want.iter().all(|(k, v)| have.get(k) == Some(v)),
            _ => &stored == expected,
        };
        if !contains {
            return Err(VerificationError::ValueMismatch {
                kind: kind.to_string(),
                name: name.to_string(),
                expected: expected.clone(),
                actual: stored,
            });
        }
        Ok(())
    }

    pub fn assert_not_stored(&self, kind: &str, name: &str) -> VerifyResult<()> {
        match self.transport.object(kind, name) {
            None => Ok(()),
            Some(actual) => Err(VerificationError::ValueMismatch {
                kind: kind.to_string(),
                name: name.to_string(),
                expected: Value::Null,
                actual,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verity_bulkops::{DependencyDag, Mode, Payload, Transport};

    #[tokio::test]
    async fn test_call_assertions() {
        let mock = MockTransport::new();
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        let tenant = dag.kind("tenant").unwrap();
        let service = dag.kind("service").unwrap();

        mock.put_bulk(tenant, &[("T".into(), Payload::new().with("enable", true))])
            .await
            .unwrap();
        mock.put_bulk(service, &[("S".into(), Payload::new())]).await.unwrap();

        let verify = CallVerifier::new(&mock);
        verify.assert_called(CallMethod::Put, "tenant").unwrap();
        verify.assert_not_called(CallMethod::Delete, "tenant").unwrap();
        verify.assert_call_count(CallMethod::Put, "service", 1).unwrap();
        verify
            .assert_completed_before((CallMethod::Put, "tenant"), (CallMethod::Put, "service"))
            .unwrap();
        assert_eq!(
            verify.assert_completed_before((CallMethod::Put, "service"), (CallMethod::Put, "tenant")),
            Err(VerificationError::OrderViolation {
                first: "PUT service".into(),
                second: "PUT tenant".into(),
            })
        );
        verify
            .assert_payload(CallMethod::Put, "tenant", "T", &json!({"enable": true}))
            .unwrap();
        verify.assert_stored("tenant", "T", &json!({"enable": true})).unwrap();
        assert!(verify.assert_stored("tenant", "missing", &json!({})).is_err());
    }
}
