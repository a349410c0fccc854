//! DataVolume Custom Resource Definition
//!
//! A DataVolume declares what data should populate a PersistentVolumeClaim
//! (import, upload, clone, blank or an external populator) and how the claim
//! should be provisioned. The controller owns the status subresource.

use std::fmt;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimSpec, TypedLocalObjectReference, TypedObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    namespaced,
    status = "DataVolumeStatus",
    shortname = "dv",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#,
    printcolumn = r#"{"name":"Restarts","type":"integer","jsonPath":".status.restartCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Where the data comes from. Mutually exclusive with `sourceRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DataVolumeSource>,

    /// Indirect source through a DataSource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<DataVolumeSourceRef>,

    /// Claim spec used verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PersistentVolumeClaimSpec>,

    /// Compact claim spec completed from the storage class and its profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<DataVolumeContentType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preallocation: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Snapshot checkpoints for multi-stage imports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<DataVolumeCheckpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checkpoint: Option<bool>,
}

/// Data source of a DataVolume. Exactly one variant is set on the wire.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum DataVolumeSource {
    Http(DataVolumeSourceHttp),
    S3(DataVolumeSourceS3),
    Gcs(DataVolumeSourceGcs),
    Registry(DataVolumeSourceRegistry),
    Blank(DataVolumeBlankImage),
    Imageio(DataVolumeSourceImageIo),
    Vddk(DataVolumeSourceVddk),
    Upload(DataVolumeSourceUpload),
    Pvc(DataVolumeSourcePvc),
    Snapshot(DataVolumeSourceSnapshot),
}

impl DataVolumeSource {
    /// Value of the `storage.import.source` annotation for import sources
    pub fn import_source_name(&self) -> Option<&'static str> {
        match self {
            DataVolumeSource::Http(_) => Some("http"),
            DataVolumeSource::S3(_) => Some("s3"),
            DataVolumeSource::Gcs(_) => Some("gcs"),
            DataVolumeSource::Registry(_) => Some("registry"),
            DataVolumeSource::Blank(_) => Some("none"),
            DataVolumeSource::Imageio(_) => Some("imageio"),
            DataVolumeSource::Vddk(_) => Some("vddk"),
            DataVolumeSource::Upload(_)
            | DataVolumeSource::Pvc(_)
            | DataVolumeSource::Snapshot(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceHttp {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_extra_headers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceS3 {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceGcs {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_stream: Option<String>,
    /// `pod` or `node`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeBlankImage {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceImageIo {
    pub url: String,
    pub disk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceVddk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_image_url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeSourceUpload {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourcePvc {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceSnapshot {
    pub namespace: String,
    pub name: String,
}

/// Pointer to a DataSource; the namespace defaults to the DataVolume's
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<VolumeResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<TypedLocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_ref: Option<TypedObjectReference>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataVolumeContentType {
    #[default]
    Kubevirt,
    Archive,
}

impl DataVolumeContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataVolumeContentType::Kubevirt => "kubevirt",
            DataVolumeContentType::Archive => "archive",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeCheckpoint {
    pub previous: String,
    pub current: String,
}

/// Observed state of a DataVolume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,

    #[serde(default)]
    pub phase: DataVolumePhase,

    /// Transfer progress, e.g. "12.34%" or "N/A"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,

    #[serde(default)]
    pub restart_count: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DataVolumeCondition>,
}

/// Lifecycle phase of a DataVolume
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DataVolumePhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    PVCBound,
    ImportScheduled,
    ImportInProgress,
    CloneScheduled,
    CloneInProgress,
    UploadScheduled,
    UploadReady,
    WaitForFirstConsumer,
    PendingPopulation,
    Paused,
    Succeeded,
    Failed,
    Unknown,
}

impl DataVolumePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataVolumePhase::Unset => "",
            DataVolumePhase::Pending => "Pending",
            DataVolumePhase::PVCBound => "PVCBound",
            DataVolumePhase::ImportScheduled => "ImportScheduled",
            DataVolumePhase::ImportInProgress => "ImportInProgress",
            DataVolumePhase::CloneScheduled => "CloneScheduled",
            DataVolumePhase::CloneInProgress => "CloneInProgress",
            DataVolumePhase::UploadScheduled => "UploadScheduled",
            DataVolumePhase::UploadReady => "UploadReady",
            DataVolumePhase::WaitForFirstConsumer => "WaitForFirstConsumer",
            DataVolumePhase::PendingPopulation => "PendingPopulation",
            DataVolumePhase::Paused => "Paused",
            DataVolumePhase::Succeeded => "Succeeded",
            DataVolumePhase::Failed => "Failed",
            DataVolumePhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DataVolumePhase::Succeeded | DataVolumePhase::Failed)
    }
}

impl fmt::Display for DataVolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition on a DataVolume
///
/// Unlike the generic Kubernetes condition this one tracks a heartbeat that
/// moves whenever the reason or message changes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeCondition {
    /// Bound, Ready or Running
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DataVolume {
    /// Current phase, `Unset` when no status has been written yet
    pub fn phase(&self) -> DataVolumePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Storage class named by either `spec.pvc` or `spec.storage`
    pub fn storage_class_name(&self) -> Option<&str> {
        self.spec
            .pvc
            .as_ref()
            .and_then(|p| p.storage_class_name.as_deref())
            .or_else(|| {
                self.spec
                    .storage
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
            })
    }

    /// True when the claim is filled by a populator outside this controller
    pub fn uses_external_populator(&self) -> bool {
        if let Some(pvc) = &self.spec.pvc {
            if pvc.data_source.is_some() || pvc.data_source_ref.is_some() {
                return true;
            }
        }
        if let Some(storage) = &self.spec.storage {
            if storage.data_source.is_some() || storage.data_source_ref.is_some() {
                return true;
            }
        }
        false
    }
}
