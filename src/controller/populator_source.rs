//! Populator source objects shared by the import, upload and clone controllers

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedObjectReference};
use kube::ResourceExt;
use tracing::info;

use crate::crd::{DataVolume, CDI_API_GROUP};
use crate::error::Result;

use super::annotations::{set_annotation, ANN_IMMEDIATE_BINDING};
use super::config::ClusterSettings;
use super::ownership::owner_reference;
use super::reconciler::ReconcilerBase;
use super::store::{ObjectKey, PopulatorKind, PopulatorSource};

/// `<prefix>-<dv uid>`
pub fn populator_source_name(kind: PopulatorKind, dv: &DataVolume) -> String {
    format!(
        "{}-{}",
        kind.name_prefix(),
        dv.metadata.uid.as_deref().unwrap_or_default()
    )
}

pub fn populator_source_key(kind: PopulatorKind, dv: &DataVolume) -> ObjectKey {
    ObjectKey::new(
        dv.namespace().unwrap_or_default(),
        populator_source_name(kind, dv),
    )
}

/// Point the claim at the DataVolume's populator source.
///
/// Without WaitForFirstConsumer support the claim also asks for immediate
/// binding so population can start without a consumer.
pub fn set_populator_data_source_ref(
    pvc: &mut PersistentVolumeClaim,
    kind: PopulatorKind,
    dv: &DataVolume,
    settings: &ClusterSettings,
) {
    if !settings.honor_wffc {
        set_annotation(pvc, ANN_IMMEDIATE_BINDING, "");
    }
    let spec = pvc.spec.get_or_insert_with(Default::default);
    spec.data_source_ref = Some(TypedObjectReference {
        api_group: Some(CDI_API_GROUP.to_string()),
        kind: kind.kind().to_string(),
        name: populator_source_name(kind, dv),
        namespace: None,
    });
}

/// Name, namespace and controller reference for a new populator source
pub fn source_metadata(kind: PopulatorKind, dv: &DataVolume) -> kube::api::ObjectMeta {
    kube::api::ObjectMeta {
        name: Some(populator_source_name(kind, dv)),
        namespace: dv.namespace(),
        owner_references: Some(vec![owner_reference(dv)]),
        ..Default::default()
    }
}

impl ReconcilerBase {
    /// Create the populator source unless it already exists
    pub(crate) async fn ensure_populator_source(&self, source: PopulatorSource) -> Result<()> {
        let kind = source.kind();
        let key = source.key();
        if self.store.populator_source_exists(kind, &key).await? {
            return Ok(());
        }
        self.store.create_populator_source(&source).await?;
        info!("Created {} {}", kind.kind(), key);
        Ok(())
    }

    /// Remove the DataVolume's populator source; a missing object is fine
    pub(crate) async fn delete_populator_source(
        &self,
        kind: PopulatorKind,
        dv: &DataVolume,
    ) -> Result<()> {
        let key = populator_source_key(kind, dv);
        self.store.delete_populator_source(kind, &key).await
    }
}
