//! Test fixtures for common intent patterns
//!
//! Realistic payloads for the kinds the tests exercise, plus a scenario
//! builder that submits a sequence of intents and checks the controller's
//! state afterwards.

use crate::verification::{CallVerifier, VerifyResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use verity_bulkops::{BulkOperationManager, Intent, IntentHandle, Payload, Result};

/// Routing policy fixtures (datacenter mode)
pub mod routing_fixtures {
    use super::*;

    /// IPv4 prefix list with one permit entry
    pub fn prefix_list(name: &str, prefix: &str) -> Intent {
        Intent::create(
            "ipv4_prefix_list",
            name,
            Payload::new().with("enable", true).with(
                "lists",
                json!([{ "enable": true, "permit_deny": "permit", "ipv4_prefix": prefix, "index": 1 }]),
            ),
        )
    }

    /// Route map clause matching a prefix list
    pub fn route_map_clause(name: &str, prefix_list: &str) -> Intent {
        Intent::create(
            "route_map_clause",
            name,
            Payload::new()
                .with("enable", true)
                .with("permit_deny", "permit")
                .with("match_ipv4_prefix_list", prefix_list)
                .with("match_ipv4_prefix_list_ref_type_", "ipv4_prefix_list"),
        )
    }

    /// Route map clause matching a tenant VRF
    pub fn vrf_match_clause(name: &str, tenant: &str) -> Intent {
        Intent::create(
            "route_map_clause",
            name,
            Payload::new()
                .with("enable", true)
                .with("permit_deny", "permit")
                .with("match_vrf", tenant)
                .with("match_vrf_ref_type_", "tenant"),
        )
    }

    /// Route map referencing clauses in order
    pub fn route_map(name: &str, clauses: &[&str]) -> Intent {
        let entries: Vec<Value> = clauses
            .iter()
            .enumerate()
            .map(|(i, c)| json!({ "enable": true, "route_map_clause": c, "index": i + 1 }))
            .collect();
        Intent::create(
            "route_map",
            name,
            Payload::new().with("enable", true).with("route_map_clauses", entries),
        )
    }
}

/// Tenancy fixtures
pub mod tenant_fixtures {
    use super::*;

    pub fn tenant(name: &str) -> Intent {
        Intent::create(
            "tenant",
            name,
            Payload::new().with("enable", true).with("layer_3_vni_mode", "auto"),
        )
    }

    /// Service bound to a tenant
    pub fn service(name: &str, tenant: &str, vlan: u16) -> Intent {
        Intent::create(
            "service",
            name,
            Payload::new()
                .with("enable", true)
                .with("tenant", tenant)
                .with("tenant_ref_type_", "tenant")
                .with("vlan", vlan),
        )
    }

    pub fn gateway(name: &str, tenant: &str) -> Intent {
        Intent::create(
            "gateway",
            name,
            Payload::new()
                .with("enable", true)
                .with("tenant", tenant)
                .with("bgp_keepalive_timer", 60),
        )
    }
}

/// Fixtures for kinds valid in both modes
pub mod common_fixtures {
    use super::*;

    pub fn badge(name: &str, color: u64) -> Intent {
        Intent::create("badge", name, Payload::new().with("enable", true).with("color", color))
    }

    /// Site settings; sites only accept partial updates
    pub fn site(name: &str, region: &str) -> Intent {
        Intent::update(
            "site",
            name,
            Payload::new()
                .with("enable", true)
                .with("region_name", region)
                .with_null("dscp_to_p_bit_map"),
        )
    }
}

/// Multi-step test scenario
#[derive(Debug, Default)]
pub struct TestScenario {
    pub name: String,
    /// Intents submitted in order
    pub intents: Vec<Intent>,
    /// Fields expected on stored objects after flush, by `(kind, name)`
    pub expected: BTreeMap<(String, String), Value>,
    /// Objects expected to be absent after flush
    pub absent: Vec<(String, String)>,
}

impl TestScenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_intent(mut self, intent: Intent) -> Self {
        self.intents.push(intent);
        self
    }

    pub fn expect_stored(mut self, kind: &str, name: &str, fields: Value) -> Self {
        self.expected.insert((kind.to_string(), name.to_string()), fields);
        self
    }

    pub fn expect_absent(mut self, kind: &str, name: &str) -> Self {
        self.absent.push((kind.to_string(), name.to_string()));
        self
    }

    /// Submits every intent; stops at the first submission error.
    pub fn submit(&self, manager: &BulkOperationManager) -> Result<Vec<IntentHandle>> {
        self.intents
            .iter()
            .map(|intent| manager.submit(intent.clone()))
            .collect()
    }

    /// Checks the controller's state against the expectations.
    pub fn verify(&self, verifier: &CallVerifier<'_>) -> VerifyResult<()> {
        for ((kind, name), fields) in &self.expected {
            verifier.assert_stored(kind, name, fields)?;
        }
        for (kind, name) in &self.absent {
            verifier.assert_not_stored(kind, name)?;
        }
        Ok(())
    }
}
