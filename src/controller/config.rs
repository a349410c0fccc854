//! Controller and cluster configuration
//!
//! `ControllerConfig` comes from the command line. `ClusterSettings` is the
//! view of the `CDIConfig` singleton taken once per reconcile, with command
//! line overrides applied to the feature gates.

use std::collections::BTreeMap;

use crate::crd::{CDIConfig, FEATURE_GATE_CLAIM_ADOPTION, FEATURE_GATE_HONOR_WFFC};

/// TTL applied when the CDIConfig does not set one
pub const DEFAULT_DATA_VOLUME_TTL_SECONDS: i32 = 0;

/// Process-wide configuration shared by every DataVolume controller
#[derive(Clone, Debug, Default)]
pub struct ControllerConfig {
    /// Labels stamped on every PVC the controller creates
    pub installer_labels: BTreeMap<String, String>,
    /// Overrides the HonorWaitForFirstConsumer gate when set
    pub honor_wffc: Option<bool>,
    /// Overrides the DataVolumeClaimAdoption gate when set
    pub claim_adoption: Option<bool>,
}

/// Parse a `key=value` installer label
pub fn parse_label(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid label {:?}, expected key=value", raw))?;
    if key.is_empty() {
        return Err(format!("invalid label {:?}, empty key", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Effective cluster settings for a single reconcile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterSettings {
    /// Seconds before a succeeded DataVolume is collected, negative disables
    pub ttl_seconds: i32,
    pub honor_wffc: bool,
    pub claim_adoption: bool,
    pub(crate) cdi_config: Option<CDIConfig>,
}

impl ClusterSettings {
    pub fn resolve(config: &ControllerConfig, cdi_config: Option<CDIConfig>) -> Self {
        let gate = |name: &str| {
            cdi_config
                .as_ref()
                .map(|c| c.feature_gate_enabled(name))
                .unwrap_or(false)
        };
        Self {
            ttl_seconds: cdi_config
                .as_ref()
                .and_then(|c| c.spec.data_volume_ttl_seconds)
                .unwrap_or(DEFAULT_DATA_VOLUME_TTL_SECONDS),
            honor_wffc: config
                .honor_wffc
                .unwrap_or_else(|| gate(FEATURE_GATE_HONOR_WFFC)),
            claim_adoption: config
                .claim_adoption
                .unwrap_or_else(|| gate(FEATURE_GATE_CLAIM_ADOPTION)),
            cdi_config,
        }
    }

    /// Filesystem overhead fraction for a storage class
    pub fn filesystem_overhead(&self, storage_class: Option<&str>) -> f64 {
        self.cdi_config
            .as_ref()
            .map(|c| c.filesystem_overhead_for(storage_class))
            .unwrap_or(0.0)
    }

    pub fn gc_disabled(&self) -> bool {
        self.ttl_seconds < 0
    }
}
