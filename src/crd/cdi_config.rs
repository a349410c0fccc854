//! CDIConfig Custom Resource Definition
//!
//! Cluster singleton named `config` carrying controller-wide settings.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton CDIConfig object
pub const CDI_CONFIG_NAME: &str = "config";

/// Feature gate: mark DataVolumes WaitForFirstConsumer instead of binding eagerly
pub const FEATURE_GATE_HONOR_WFFC: &str = "HonorWaitForFirstConsumer";
/// Feature gate: adopt pre-existing PVCs that share a DataVolume's name
pub const FEATURE_GATE_CLAIM_ADOPTION: &str = "DataVolumeClaimAdoption";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "CDIConfig",
    status = "CDIConfigStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CDIConfigSpec {
    /// Seconds a succeeded DataVolume lives before garbage collection.
    /// Negative disables collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_ttl_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_overhead: Option<FilesystemOverhead>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CDIConfigStatus {
    /// Effective overhead, resolved from the spec and defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_overhead: Option<FilesystemOverhead>,
}

/// Fraction of a filesystem volume reserved for metadata, as a decimal string
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemOverhead {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_class: BTreeMap<String, String>,
}

impl CDIConfig {
    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.spec.feature_gates.iter().any(|g| g == gate)
    }

    /// Overhead for the class, falling back to the global value
    pub fn filesystem_overhead_for(&self, storage_class: Option<&str>) -> f64 {
        let Some(overhead) = self.status.as_ref().and_then(|s| s.filesystem_overhead.as_ref())
        else {
            return 0.0;
        };
        storage_class
            .and_then(|sc| overhead.storage_class.get(sc))
            .or(overhead.global.as_ref())
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| (0.0..1.0).contains(v))
            .unwrap_or(0.0)
    }
}
