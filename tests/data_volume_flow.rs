//! End-to-end reconcile of an upload DataVolume against the in-memory store
//!
//! Run with: cargo test --features test-util --test data_volume_flow

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use datavolume_controller::controller::annotations::{
    annotation, set_annotation, ANN_POD_PHASE, ANN_POD_READY, ANN_UPLOAD_REQUEST,
};
use datavolume_controller::controller::fake::{FakeStore, RecordingRecorder};
use datavolume_controller::controller::{
    classify, reconcile_key, ControllerConfig, DataVolumeOp, ObjectKey, ReconcileResult,
    ReconcilerBase, UploadController,
};
use datavolume_controller::crd::{
    DataVolume, DataVolumePhase, DataVolumeSource, DataVolumeSourceUpload, DataVolumeSpec,
};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

fn upload_data_volume() -> DataVolume {
    let mut dv = DataVolume::new(
        "upload",
        DataVolumeSpec {
            source: Some(DataVolumeSource::Upload(DataVolumeSourceUpload {})),
            pvc: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("2Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    dv.metadata.namespace = Some("vms".to_string());
    dv
}

/// Stand in for the upload server reporting through the claim
fn report(store: &FakeStore, key: &ObjectKey, pod_phase: &str, ready: bool) {
    let mut pvc = store.pvc(key).expect("claim should exist");
    pvc.status = Some(PersistentVolumeClaimStatus {
        phase: Some("Bound".to_string()),
        ..Default::default()
    });
    set_annotation(&mut pvc, ANN_POD_PHASE, pod_phase);
    set_annotation(&mut pvc, ANN_POD_READY, ready.to_string());
    store.insert_pvc(pvc);
}

#[tokio::test]
async fn upload_data_volume_lifecycle() {
    let store = Arc::new(FakeStore::new());
    let recorder = Arc::new(RecordingRecorder::new());
    let ctrl = UploadController::new(ReconcilerBase::new(
        store.clone(),
        recorder.clone(),
        ControllerConfig::default(),
    ));
    let dv = store.insert_data_volume(upload_data_volume());
    let key = ObjectKey::new("vms", "upload");

    assert_eq!(classify(&dv, |_| None), DataVolumeOp::Upload);

    // First pass creates the upload target
    let result = reconcile_key(&ctrl, &key).await.unwrap();
    assert_eq!(result, ReconcileResult::requeue_after(Duration::from_secs(2)));
    let pvc = store.pvc(&key).expect("claim should be created");
    assert_eq!(annotation(&pvc, ANN_UPLOAD_REQUEST), Some(""));

    // Upload server is up
    report(&store, &key, "Running", true);
    reconcile_key(&ctrl, &key).await.unwrap();
    let dv = store.data_volume(&key).unwrap();
    assert_eq!(dv.phase(), DataVolumePhase::UploadReady);
    assert_eq!(recorder.count("UploadReady"), 1);

    // Upload finished
    report(&store, &key, "Succeeded", false);
    let result = reconcile_key(&ctrl, &key).await.unwrap();
    assert_eq!(result, ReconcileResult::done());
    let dv = store.data_volume(&key).unwrap();
    assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
    let event = recorder.find("UploadSucceeded").expect("success event");
    assert_eq!(event.message, "Successfully uploaded into upload");
    assert_eq!(event.object, "vms/upload");
}
