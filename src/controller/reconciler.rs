//! DataVolume reconcilers
//!
//! One kube-runtime controller runs per operation. Each reconcile runs the
//! sync stage then the status stage; the status stage runs even when sync
//! failed so the DataVolume reflects what was observed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{DataVolume, DataVolumePhase, ObjectTransfer, StorageProfile};
use crate::error::{Error, Result};

use super::clone::CloneController;
use super::config::ControllerConfig;
use super::events::{EventRecorder, KubeRecorder};
use super::import::ImportController;
use super::operation::{classify, DataVolumeOp};
use super::ownership::CONTROLLER_NAME;
use super::populator::PopulatorController;
use super::status::update_status;
use super::store::{KubeStore, ObjectKey, ObjectStore};
use super::sync::{sync, ReconcileResult, StatusEvent, SyncState};
use super::upload::UploadController;
use super::watches;

/// Dependencies shared by every operation controller
#[derive(Clone)]
pub struct ReconcilerBase {
    pub store: Arc<dyn ObjectStore>,
    pub recorder: Arc<dyn EventRecorder>,
    pub config: ControllerConfig,
}

impl ReconcilerBase {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            recorder,
            config,
        }
    }
}

/// Operation-specific hooks around the shared sync and status stages
#[async_trait]
pub trait DataVolumeController: Send + Sync {
    fn op(&self) -> DataVolumeOp;

    fn base(&self) -> &ReconcilerBase;

    /// Populator decision; `None` leaves the annotation alone
    async fn use_populator(&self, _state: &SyncState) -> Result<Option<bool>> {
        Ok(None)
    }

    /// Runs before the deletion check on every reconcile
    async fn cleanup(&self, _state: &mut SyncState) -> Result<()> {
        Ok(())
    }

    /// Runs before the claim spec is rendered
    async fn prepare(&self, _state: &mut SyncState) -> Result<()> {
        Ok(())
    }

    /// Operation body, typically creating the claim
    async fn sync_body(&self, state: &mut SyncState) -> Result<()>;

    /// Refine the phase from the worker pod state reported on the claim
    async fn update_status_phase(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &mut DataVolume,
        event: &mut StatusEvent,
    ) -> Result<()>;
}

/// Reconcile one key: sync, then status.
///
/// A sync error wins over a status error; an explicit sync result wins over
/// the status stage's requeue.
pub async fn reconcile_key(
    ctrl: &dyn DataVolumeController,
    key: &ObjectKey,
) -> Result<ReconcileResult> {
    let (sync_result, sync_err) = sync(ctrl, key).await;
    let status = update_status(ctrl, key, sync_result.phase_sync).await;

    if let Err(e) = sync_err {
        if let Err(status_err) = &status {
            warn!("Status update for {} failed after sync error: {}", key, status_err);
        }
        return Err(e);
    }
    let result = status?;
    Ok(sync_result.result.unwrap_or(result))
}

/// DataVolumes waiting on a default storage class
pub fn pending_default_storage_class_count(store: &dyn ObjectStore) -> usize {
    [DataVolumePhase::Unset, DataVolumePhase::Pending]
        .into_iter()
        .flat_map(|phase| store.data_volumes_by_phase(phase))
        .filter(|dv| dv.storage_class_name().unwrap_or_default().is_empty())
        .count()
}

// ============================================================================
// kube-runtime glue
// ============================================================================

/// Shared state for one operation controller
pub struct ControllerState {
    pub client: Client,
    pub controller: Arc<dyn DataVolumeController>,
}

/// Main entry point: start one controller per operation and wait for all
pub async fn run_controllers(
    client: Client,
    config: ControllerConfig,
    namespace: Option<String>,
) -> Result<()> {
    let data_volumes: Api<DataVolume> = Api::all(client.clone());

    info!("Starting DataVolume controllers");

    // Verify CRD exists
    match data_volumes.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("DataVolume CRD is available"),
        Err(e) => {
            error!(
                "DataVolume CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "DataVolume CRD not installed".to_string(),
            ));
        }
    }

    let store = Arc::new(KubeStore::start(client.clone()).await?);
    let recorder: Arc<dyn EventRecorder> =
        Arc::new(KubeRecorder::new(client.clone(), CONTROLLER_NAME));
    let base = ReconcilerBase::new(store.clone(), recorder, config);

    let controllers: Vec<Arc<dyn DataVolumeController>> = vec![
        Arc::new(ImportController::new(base.clone())),
        Arc::new(UploadController::new(base.clone())),
        Arc::new(CloneController::new(base.clone(), DataVolumeOp::PvcClone)),
        Arc::new(CloneController::new(base.clone(), DataVolumeOp::SnapshotClone)),
        Arc::new(PopulatorController::new(base)),
    ];

    let runs = controllers.into_iter().map(|controller| {
        let state = Arc::new(ControllerState {
            client: client.clone(),
            controller,
        });
        run_controller(state, store.clone(), namespace.clone())
    });
    futures::future::join_all(runs).await;

    Ok(())
}

async fn run_controller(
    state: Arc<ControllerState>,
    store: Arc<KubeStore>,
    namespace: Option<String>,
) {
    let client = state.client.clone();
    let op = state.controller.op();
    let data_volumes: Api<DataVolume> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("Starting {} DataVolume controller", op);

    let cache = store.data_volume_cache();
    let pv_cache = cache.clone();
    let sc_store = store.clone();
    let profile_store = store.clone();

    Controller::new(data_volumes, Config::default())
        .watches(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            Config::default(),
            |pvc| watches::data_volumes_for_pvc(&pvc),
        )
        .watches(
            Api::<Pod>::all(client.clone()),
            Config::default(),
            |pod| watches::data_volumes_for_pod(&pod),
        )
        .watches(
            Api::<ObjectTransfer>::all(client.clone()),
            Config::default(),
            |transfer| watches::data_volumes_for_transfer(&transfer),
        )
        .watches(
            Api::<StorageClass>::all(client.clone()),
            Config::default(),
            move |_| watches::unset_phase_data_volumes(sc_store.as_ref()),
        )
        .watches(
            Api::<StorageProfile>::all(client.clone()),
            Config::default(),
            move |_| watches::unset_phase_data_volumes(profile_store.as_ref()),
        )
        .watches(
            Api::<PersistentVolume>::all(client.clone()),
            Config::default(),
            move |pv| {
                let pending: Vec<DataVolume> = pv_cache
                    .state()
                    .iter()
                    .filter(|dv| dv.phase() == DataVolumePhase::Pending)
                    .map(|dv| (**dv).clone())
                    .collect();
                watches::data_volumes_for_available_pv(&pv, &pending)
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;
}

/// The main reconciliation function
///
/// Every controller sees every DataVolume event; only the controller owning
/// the DataVolume's operation does any work.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace(), op = %ctx.controller.op()))]
async fn reconcile(obj: Arc<DataVolume>, ctx: Arc<ControllerState>) -> Result<Action> {
    let ctrl = ctx.controller.as_ref();
    let base = ctrl.base();

    let op = classify(&obj, |k| base.store.data_source(k));
    if op != ctrl.op() {
        return Ok(Action::await_change());
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();
    #[cfg(feature = "metrics")]
    super::metrics::set_data_volume_pending(
        pending_default_storage_class_count(base.store.as_ref()) as i64,
    );

    let key = ObjectKey::from_resource(obj.as_ref());
    let res = reconcile_key(ctrl, &key).await;

    #[cfg(feature = "metrics")]
    {
        let op_name = op.to_string();
        super::metrics::observe_reconcile_duration_seconds(
            &op_name,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &res {
            super::metrics::inc_reconcile_error(&op_name, e.kind());
        }
    }

    res.map(ReconcileResult::into_action)
}

/// Error policy for the controller
fn error_policy(dv: Arc<DataVolume>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", dv.name_any(), error);

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
