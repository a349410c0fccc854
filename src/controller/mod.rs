//! Controller module for DataVolume reconciliation
//! This module contains the per-operation controllers, the shared sync and
//! status stages, and the helpers that keep claims and DataVolumes in step.

pub mod annotations;
mod clone;
pub mod conditions;
pub mod config;
pub mod events;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod garbage_collect;
mod import;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod operation;
pub mod ownership;
mod populator;
mod populator_source;
pub mod progress;
pub mod quantity;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod render;
pub mod static_volume;
mod status;
pub mod store;
mod sync;
mod upload;
mod watches;

pub use clone::{CloneController, CloneSourceKind};
pub use config::{parse_label, ClusterSettings, ControllerConfig};
pub use events::{EventRecorder, EventType, KubeRecorder};
pub use import::ImportController;
pub use operation::{classify, DataVolumeOp};
pub use populator::PopulatorController;
pub use reconciler::{
    pending_default_storage_class_count, reconcile_key, run_controllers, ControllerState,
    DataVolumeController, ReconcilerBase,
};
pub use status::update_status;
pub use store::{KubeStore, ObjectKey, ObjectStore, PopulatorKind, PopulatorSource};
pub use sync::{sync, PhaseSync, ReconcileResult, StatusEvent, SyncResult, SyncState};
pub use upload::UploadController;
