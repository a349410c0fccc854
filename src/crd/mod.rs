//! Custom Resource Definitions for the DataVolume controller
//!
//! All resources live in the `cdi.kubevirt.io/v1beta1` API group.

pub mod cdi_config;
mod data_source;
mod data_volume;
pub mod populators;
mod storage_profile;

#[cfg(test)]
mod tests;

pub use cdi_config::{
    CDIConfig, CDIConfigSpec, CDIConfigStatus, FilesystemOverhead, CDI_CONFIG_NAME,
    FEATURE_GATE_CLAIM_ADOPTION, FEATURE_GATE_HONOR_WFFC,
};
pub use data_source::{DataSource, DataSourceRefSourceDataSource, DataSourceSource, DataSourceSpec};
pub use data_volume::*;
pub use populators::{
    ObjectTransfer, ObjectTransferSpec, VolumeCloneSource, VolumeCloneSourceSpec,
    VolumeImportSource, VolumeImportSourceSpec, VolumeUploadSource, VolumeUploadSourceSpec,
};
pub use storage_profile::{
    ClaimPropertySet, StorageProfile, StorageProfileSpec, StorageProfileStatus,
};

/// API group shared by every resource in this crate
pub const CDI_API_GROUP: &str = "cdi.kubevirt.io";
