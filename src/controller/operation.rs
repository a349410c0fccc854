//! Operation classifier
//!
//! Every DataVolume is handled by exactly one controller. This module decides
//! which one from the spec, following `sourceRef` through DataSources.

use std::collections::HashSet;
use std::fmt;

use kube::ResourceExt;

use crate::crd::{DataSource, DataVolume, DataVolumeSource};

use super::store::ObjectKey;

/// Upper bound on DataSource lookups while following a chain
pub const MAX_DATA_SOURCE_CHAIN: usize = 8;

const DATA_SOURCE_KIND: &str = "DataSource";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataVolumeOp {
    Nop,
    Import,
    Upload,
    PvcClone,
    SnapshotClone,
    Populator,
}

impl fmt::Display for DataVolumeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataVolumeOp::Nop => "nop",
            DataVolumeOp::Import => "import",
            DataVolumeOp::Upload => "upload",
            DataVolumeOp::PvcClone => "pvc-clone",
            DataVolumeOp::SnapshotClone => "snapshot-clone",
            DataVolumeOp::Populator => "populator",
        };
        f.write_str(s)
    }
}

/// Key of the DataSource a DataVolume points at, if it uses `sourceRef`
pub fn source_ref_key(dv: &DataVolume) -> Option<ObjectKey> {
    let source_ref = dv.spec.source_ref.as_ref()?;
    if source_ref.kind != DATA_SOURCE_KIND {
        return None;
    }
    let namespace = source_ref
        .namespace
        .clone()
        .or_else(|| dv.namespace())
        .unwrap_or_default();
    Some(ObjectKey::new(namespace, &source_ref.name))
}

/// Follow a DataSource chain to the DataSource holding a concrete source.
///
/// Returns `None` when a link is missing, a cycle is found, or the chain is
/// longer than [`MAX_DATA_SOURCE_CHAIN`].
pub fn resolve_data_source<F>(start: ObjectKey, lookup: F) -> Option<DataSource>
where
    F: Fn(&ObjectKey) -> Option<DataSource>,
{
    let mut visited = HashSet::new();
    let mut key = start;
    for _ in 0..MAX_DATA_SOURCE_CHAIN {
        if !visited.insert(key.clone()) {
            return None;
        }
        let ds = lookup(&key)?;
        match &ds.spec.source.data_source {
            Some(next) => key = ObjectKey::new(&next.namespace, &next.name),
            None => return Some(ds),
        }
    }
    None
}

/// Decide which controller owns a DataVolume
pub fn classify<F>(dv: &DataVolume, lookup: F) -> DataVolumeOp
where
    F: Fn(&ObjectKey) -> Option<DataSource>,
{
    if dv.spec.source_ref.is_some() {
        let Some(key) = source_ref_key(dv) else {
            return DataVolumeOp::Nop;
        };
        return match resolve_data_source(key, lookup) {
            Some(ds) if ds.spec.source.pvc.is_some() => DataVolumeOp::PvcClone,
            Some(ds) if ds.spec.source.snapshot.is_some() => DataVolumeOp::SnapshotClone,
            _ => DataVolumeOp::Nop,
        };
    }

    match &dv.spec.source {
        Some(DataVolumeSource::Pvc(_)) => DataVolumeOp::PvcClone,
        Some(DataVolumeSource::Snapshot(_)) => DataVolumeOp::SnapshotClone,
        None if dv.uses_external_populator() => DataVolumeOp::Populator,
        None => DataVolumeOp::Nop,
        Some(DataVolumeSource::Upload(_)) => DataVolumeOp::Upload,
        Some(
            DataVolumeSource::Http(_)
            | DataVolumeSource::S3(_)
            | DataVolumeSource::Gcs(_)
            | DataVolumeSource::Registry(_)
            | DataVolumeSource::Blank(_)
            | DataVolumeSource::Imageio(_)
            | DataVolumeSource::Vddk(_),
        ) => DataVolumeOp::Import,
    }
}
