//! Tests for the reconcile flow
//!
//! These tests drive the sync and status stages against the in-memory store:
//! - Phase and condition derivation from the claim
//! - Claim creation for a fresh DataVolume
//! - Targeted status outcomes (quota, missing storage class, missing clone source)
//! - Claim adoption, static volumes and delayed annotations
//! - Garbage collection after the TTL

#[cfg(test)]
mod tests {
    use super::super::annotations::*;
    use super::super::clone::CloneController;
    use super::super::conditions::{
        find_condition, CONDITION_TYPE_BOUND, CONDITION_TYPE_READY, CONDITION_TYPE_RUNNING,
    };
    use super::super::config::ControllerConfig;
    use super::super::events::{EventType, MockEventRecorder};
    use super::super::fake::{FakeStore, RecordingRecorder};
    use super::super::import::ImportController;
    use super::super::operation::DataVolumeOp;
    use super::super::ownership::owner_reference;
    use super::super::reconciler::*;
    use super::super::status::update_status;
    use super::super::store::ObjectKey;
    use super::super::sync::ReconcileResult;
    use crate::crd::{
        CDIConfig, CDIConfigSpec, DataVolume, DataVolumeCondition, DataVolumePhase,
        DataVolumeSource, DataVolumeSourcePvc, DataVolumeSpec, DataVolumeStatus, StorageSpec,
    };
    use crate::error::Error;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus, Pod,
        PodStatus, TypedObjectReference, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::api::ObjectMeta;
    use kube::ResourceExt;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    /// Helper to create a blank DataVolume with an explicit claim spec
    fn create_test_data_volume(name: &str) -> DataVolume {
        let mut dv = DataVolume::new(
            name,
            DataVolumeSpec {
                source: Some(DataVolumeSource::Blank(Default::default())),
                pvc: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity("1Gi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        dv.metadata.namespace = Some("default".to_string());
        dv
    }

    /// Helper to create a claim in the given phase
    fn create_test_claim(name: &str, phase: &str, anno: &[(&str, &str)]) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    anno.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec::default()),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn setup() -> (Arc<FakeStore>, Arc<RecordingRecorder>, ImportController) {
        let store = Arc::new(FakeStore::new());
        let recorder = Arc::new(RecordingRecorder::new());
        let ctrl = ImportController::new(ReconcilerBase::new(
            store.clone(),
            recorder.clone(),
            ControllerConfig::default(),
        ));
        (store, recorder, ctrl)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "test")
    }

    fn condition(dv: &DataVolume, type_: &str) -> DataVolumeCondition {
        let status = dv.status.as_ref().expect("status should be set");
        find_condition(&status.conditions, type_)
            .cloned()
            .unwrap_or_else(|| panic!("missing {} condition", type_))
    }

    fn assert_condition(dv: &DataVolume, type_: &str, status: &str, message: &str, reason: &str) {
        let c = condition(dv, type_);
        assert_eq!(c.status, status, "{} status", type_);
        assert_eq!(c.message, message, "{} message", type_);
        assert_eq!(c.reason, reason, "{} reason", type_);
    }

    // ========================================================================
    // Status derivation
    // ========================================================================

    #[tokio::test]
    async fn test_no_claim_sets_pending() {
        let (store, recorder, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));

        let result = update_status(&ctrl, &key(), None).await.unwrap();
        assert_eq!(result, ReconcileResult::done());

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Pending);
        assert_condition(&dv, CONDITION_TYPE_BOUND, "Unknown", "No PVC found", "NotFound");
        assert_eq!(condition(&dv, CONDITION_TYPE_READY).status, "False");
        assert_eq!(condition(&dv, CONDITION_TYPE_RUNNING).status, "False");
        assert_eq!(recorder.reasons(), vec!["NotFound".to_string()]);
    }

    #[tokio::test]
    async fn test_populated_bound_claim_succeeds() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim("test", "Bound", &[(ANN_POPULATED_FOR, "test")]));

        update_status(&ctrl, &key(), None).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
        assert_condition(&dv, CONDITION_TYPE_BOUND, "True", "PVC test Bound", "Bound");
        assert_eq!(condition(&dv, CONDITION_TYPE_READY).status, "True");
        assert_eq!(
            dv.status.as_ref().unwrap().claim_name.as_deref(),
            Some("test")
        );
    }

    #[tokio::test]
    async fn test_pending_claim_with_unbound_scratch() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim(
            "test",
            "Pending",
            &[
                (ANN_BOUND_CONDITION, "false"),
                (ANN_BOUND_CONDITION_MESSAGE, "scratch PVC not bound"),
                (ANN_BOUND_CONDITION_REASON, "not bound"),
            ],
        ));

        update_status(&ctrl, &key(), None).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Pending);
        assert_condition(
            &dv,
            CONDITION_TYPE_BOUND,
            "False",
            "target PVC test Pending and scratch PVC not bound",
            "not bound",
        );
        assert_eq!(condition(&dv, CONDITION_TYPE_READY).status, "False");
    }

    #[tokio::test]
    async fn test_source_not_running_overrides_running_target() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim(
            "test",
            "Bound",
            &[
                (ANN_RUNNING_CONDITION, "true"),
                (ANN_SOURCE_RUNNING_CONDITION, "false"),
                (ANN_SOURCE_RUNNING_CONDITION_MESSAGE, "scratch creating"),
                (ANN_SOURCE_RUNNING_CONDITION_REASON, "Creating Scratch"),
            ],
        ));

        update_status(&ctrl, &key(), None).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        assert_condition(
            &dv,
            CONDITION_TYPE_RUNNING,
            "False",
            "scratch creating",
            "Creating Scratch",
        );
    }

    #[tokio::test]
    async fn test_target_and_source_not_running() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim(
            "test",
            "Bound",
            &[
                (ANN_RUNNING_CONDITION, "false"),
                (ANN_RUNNING_CONDITION_MESSAGE, "Pod Pending"),
                (ANN_RUNNING_CONDITION_REASON, "Pending"),
                (ANN_SOURCE_RUNNING_CONDITION, "false"),
                (ANN_SOURCE_RUNNING_CONDITION_MESSAGE, "Pod Pending"),
                (ANN_SOURCE_RUNNING_CONDITION_REASON, "Pending"),
            ],
        ));

        update_status(&ctrl, &key(), None).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        assert_condition(
            &dv,
            CONDITION_TYPE_RUNNING,
            "False",
            "Pod Pending and Pod Pending",
            "Pending and Pending",
        );
    }

    #[tokio::test]
    async fn test_lost_claim_fails_data_volume() {
        let store = Arc::new(FakeStore::new());
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim("test", "Lost", &[]));

        let mut recorder = MockEventRecorder::new();
        recorder
            .expect_record()
            .withf(|_: &ObjectReference, event_type: &EventType, reason: &str, message: &str| {
                *event_type == EventType::Warning
                    && reason == "ErrClaimLost"
                    && message == "PVC test lost"
            })
            .times(1)
            .return_const(());
        recorder
            .expect_record()
            .withf(|_: &ObjectReference, event_type: &EventType, reason: &str, message: &str| {
                *event_type == EventType::Normal && reason == "ClaimLost" && message == "Claim Lost"
            })
            .times(1)
            .return_const(());

        let ctrl = ImportController::new(ReconcilerBase::new(
            store.clone(),
            Arc::new(recorder),
            ControllerConfig::default(),
        ));
        update_status(&ctrl, &key(), None).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Failed);
        assert_condition(&dv, CONDITION_TYPE_BOUND, "False", "Claim Lost", "ClaimLost");
    }

    #[tokio::test]
    async fn test_running_import_pod() {
        let (store, recorder, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim(
            "test",
            "Bound",
            &[
                (ANN_IMPORT_POD, "importer-test"),
                (ANN_POD_PHASE, "Running"),
                (ANN_RUNNING_CONDITION, "true"),
            ],
        ));

        let result = update_status(&ctrl, &key(), None).await.unwrap();
        assert_eq!(result, ReconcileResult::requeue_after(Duration::from_secs(2)));

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::ImportInProgress);
        assert_eq!(condition(&dv, CONDITION_TYPE_RUNNING).status, "True");
        assert_condition(&dv, CONDITION_TYPE_READY, "False", "", "TransferRunning");
        assert_eq!(recorder.count("ImportInProgress"), 1);
        assert_eq!(dv.status.as_ref().unwrap().progress.as_deref(), Some("N/A"));
    }

    // ========================================================================
    // Full reconcile
    // ========================================================================

    #[tokio::test]
    async fn test_reconcile_creates_claim() {
        let (store, _, ctrl) = setup();
        let dv = store.insert_data_volume(create_test_data_volume("test"));

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::requeue_after(Duration::from_secs(2)));

        let pvc = store.pvc(&key()).expect("claim should be created");
        assert_eq!(annotation(&pvc, ANN_SOURCE), Some("none"));
        assert_eq!(annotation(&pvc, ANN_POD_RESTARTS), Some("0"));
        assert_eq!(pvc.owner_references(), &[owner_reference(&dv)]);

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(annotation(&dv, ANN_USE_POPULATOR), Some("false"));
        assert_eq!(
            dv.status.as_ref().unwrap().claim_name.as_deref(),
            Some("test")
        );

        // Second pass is a no-op for the claim
        reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(store.pvc_update_count(), 0);
    }

    #[tokio::test]
    async fn test_quota_exceeded_sets_pending() {
        let (store, recorder, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.set_quota_exceeded(true);

        let err = reconcile_key(&ctrl, &key()).await.unwrap_err();
        assert!(err.is_quota_exceeded());

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Pending);
        assert_eq!(condition(&dv, CONDITION_TYPE_READY).reason, "ErrExceededQuota");
        let warnings = recorder
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::Warning && e.reason == "ErrExceededQuota")
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_missing_storage_class_waits() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(DataVolume {
            spec: DataVolumeSpec {
                source: Some(DataVolumeSource::Blank(Default::default())),
                storage: Some(StorageSpec {
                    storage_class_name: Some("missing".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..create_test_data_volume("test")
        });

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert!(store.pvc(&key()).is_none());

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Unset);
        assert_eq!(condition(&dv, CONDITION_TYPE_READY).reason, "ErrClaimNotValid");
    }

    #[tokio::test]
    async fn test_claim_waiting_for_populator() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        let mut pvc = create_test_claim("test", "Pending", &[]);
        pvc.spec = Some(PersistentVolumeClaimSpec {
            data_source_ref: Some(TypedObjectReference {
                api_group: Some("cdi.kubevirt.io".to_string()),
                kind: "VolumeImportSource".to_string(),
                name: "volume-import-source-uid-1".to_string(),
                namespace: None,
            }),
            ..Default::default()
        });
        store.insert_pvc(pvc);

        let result = update_status(&ctrl, &key(), None).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::PendingPopulation);
        assert_eq!(dv.status.as_ref().unwrap().progress.as_deref(), Some("N/A"));

        // Once a consumer is scheduled the import controller takes over
        let mut pvc = store.pvc(&key()).unwrap();
        set_annotation(&mut pvc, ANN_SELECTED_NODE, "node-1");
        store.insert_pvc(pvc);

        update_status(&ctrl, &key(), None).await.unwrap();
        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::ImportScheduled);
    }

    #[tokio::test]
    async fn test_stopped_worker_pod_is_not_tracked() {
        let (store, _, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        let pvc = store.insert_pvc(create_test_claim(
            "test",
            "Bound",
            &[(ANN_IMPORT_POD, "importer-test"), (ANN_POD_PHASE, "Pending")],
        ));
        store.insert_pod(Pod {
            metadata: ObjectMeta {
                name: Some("importer-test".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "PersistentVolumeClaim".to_string(),
                    name: "test".to_string(),
                    uid: pvc.metadata.uid.clone().unwrap(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let result = update_status(&ctrl, &key(), None).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::ImportScheduled);
    }

    // ========================================================================
    // Existing claims
    // ========================================================================

    #[tokio::test]
    async fn test_unowned_claim_is_rejected() {
        let (store, recorder, ctrl) = setup();
        store.insert_data_volume(create_test_data_volume("test"));
        store.insert_pvc(create_test_claim("test", "Bound", &[]));

        let err = reconcile_key(&ctrl, &key()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExists(ref name) if name == "test"));

        let warning = recorder
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::Warning && e.reason == "ErrResourceExists")
            .expect("resource exists warning");
        assert_eq!(
            warning.message,
            "Resource \"test\" already exists and is not managed by DataVolume"
        );
        assert!(store.pvc(&key()).unwrap().owner_references().is_empty());
    }

    #[tokio::test]
    async fn test_claim_adoption() {
        let (store, _, ctrl) = setup();
        let mut dv = create_test_data_volume("test");
        set_annotation(&mut dv, ANN_ALLOW_CLAIM_ADOPTION, "true");
        store.insert_data_volume(dv);
        store.insert_pvc(create_test_claim("test", "Bound", &[]));

        reconcile_key(&ctrl, &key()).await.unwrap();

        let dv = store.data_volume(&key()).unwrap();
        let pvc = store.pvc(&key()).unwrap();
        assert_eq!(pvc.owner_references(), &[owner_reference(&dv)]);
        assert_eq!(annotation(&pvc, ANN_POPULATED_FOR), Some("test"));
        assert_eq!(annotation(&dv, ANN_PRE_POPULATED), Some("test"));
        assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
    }

    #[tokio::test]
    async fn test_delayed_annotations_copied_on_success() {
        let (store, _, ctrl) = setup();
        let mut dv = create_test_data_volume("test");
        set_annotation(&mut dv, ANN_POPULATED_FOR, "test");
        dv.status = Some(DataVolumeStatus {
            phase: DataVolumePhase::Succeeded,
            ..Default::default()
        });
        let dv = store.insert_data_volume(dv);
        let mut pvc = create_test_claim("test", "Bound", &[]);
        pvc.metadata.owner_references = Some(vec![owner_reference(&dv)]);
        store.insert_pvc(pvc);

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        let pvc = store.pvc(&key()).unwrap();
        assert_eq!(annotation(&pvc, ANN_POPULATED_FOR), Some("test"));
        assert_eq!(store.pvc_update_count(), 1);

        // Already copied, nothing more to write
        reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(store.pvc_update_count(), 1);
        assert_eq!(
            store.data_volume(&key()).unwrap().phase(),
            DataVolumePhase::Succeeded
        );
    }

    #[tokio::test]
    async fn test_clone_without_source() {
        let store = Arc::new(FakeStore::new());
        let recorder = Arc::new(RecordingRecorder::new());
        let ctrl = CloneController::new(
            ReconcilerBase::new(store.clone(), recorder.clone(), ControllerConfig::default()),
            DataVolumeOp::PvcClone,
        );
        store.insert_data_volume(DataVolume {
            spec: DataVolumeSpec {
                source: Some(DataVolumeSource::Pvc(DataVolumeSourcePvc {
                    namespace: "images".to_string(),
                    name: "golden".to_string(),
                })),
                ..create_test_data_volume("test").spec
            },
            ..create_test_data_volume("test")
        });

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert!(store.pvc(&key()).is_none());

        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Unset);
        assert_condition(
            &dv,
            CONDITION_TYPE_READY,
            "False",
            "The source pvc golden doesn't exist",
            "CloneWithoutSource",
        );
        assert_condition(
            &dv,
            CONDITION_TYPE_BOUND,
            "Unknown",
            "No PVC found",
            "CloneWithoutSource",
        );
    }

    // ========================================================================
    // Static volumes
    // ========================================================================

    fn static_volume(name: &str, size: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some("local".to_string()),
                claim_ref: Some(ObjectReference {
                    namespace: Some("default".to_string()),
                    name: Some("test".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Available".to_string()),
                ..Default::default()
            }),
        }
    }

    /// Reconcile a static-volume DataVolume once, leaving its claim unbound
    async fn setup_static(store: &FakeStore, ctrl: &ImportController) {
        let mut dv = create_test_data_volume("test");
        set_annotation(&mut dv, ANN_CHECK_STATIC_VOLUME, "true");
        if let Some(pvc) = dv.spec.pvc.as_mut() {
            pvc.storage_class_name = Some("local".to_string());
        }
        store.insert_data_volume(dv);
        store.insert_pv(static_volume("pv-static", "2Gi"));
        store.insert_pv(static_volume("pv-small", "512Mi"));

        let result = reconcile_key(ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
    }

    fn bind_claim(store: &FakeStore, volume: &str) {
        let mut pvc = store.pvc(&key()).expect("claim should exist");
        if let Some(spec) = pvc.spec.as_mut() {
            spec.volume_name = Some(volume.to_string());
        }
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        store.insert_pvc(pvc);
    }

    #[tokio::test]
    async fn test_static_volume_adopted() {
        let (store, _, ctrl) = setup();
        setup_static(&store, &ctrl).await;

        let pvc = store.pvc(&key()).expect("claim should be created");
        assert_eq!(annotation(&pvc, ANN_PERSISTENT_VOLUME_LIST), Some(r#"["pv-static"]"#));
        assert_eq!(store.data_volume(&key()).unwrap().phase(), DataVolumePhase::Pending);

        bind_claim(&store, "pv-static");
        reconcile_key(&ctrl, &key()).await.unwrap();

        let pvc = store.pvc(&key()).unwrap();
        assert_eq!(annotation(&pvc, ANN_POPULATED_FOR), Some("test"));
        assert!(!has_annotation(&pvc, ANN_PERSISTENT_VOLUME_LIST));
        let dv = store.data_volume(&key()).unwrap();
        assert_eq!(annotation(&dv, ANN_PRE_POPULATED), Some("test"));
        assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
    }

    #[tokio::test]
    async fn test_static_volume_unexpected_binding() {
        let (store, _, ctrl) = setup();
        setup_static(&store, &ctrl).await;

        bind_claim(&store, "pv-other");
        let err = reconcile_key(&ctrl, &key()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedPersistentVolume { ref pv, .. } if pv == "pv-other"
        ));
        assert!(store.pvc(&key()).is_none());
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    fn vm_owner() -> OwnerReference {
        OwnerReference {
            api_version: "kubevirt.io/v1".to_string(),
            kind: "VirtualMachine".to_string(),
            name: "vm".to_string(),
            uid: "vm-uid".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Succeeded DataVolume with a claim, Ready since `age_seconds` ago
    fn setup_succeeded(store: &FakeStore, ttl: i32, age_seconds: i64) -> DataVolume {
        store.set_cdi_config(CDIConfig::new(
            "config",
            CDIConfigSpec {
                data_volume_ttl_seconds: Some(ttl),
                ..Default::default()
            },
        ));

        let mut dv = create_test_data_volume("test");
        dv.metadata.owner_references = Some(vec![vm_owner()]);
        set_annotation(&mut dv, ANN_DELETE_AFTER_COMPLETION, "true");
        dv.status = Some(DataVolumeStatus {
            phase: DataVolumePhase::Succeeded,
            conditions: vec![DataVolumeCondition {
                type_: CONDITION_TYPE_READY.to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(Utc::now() - chrono::Duration::seconds(age_seconds))),
                ..Default::default()
            }],
            ..Default::default()
        });
        let dv = store.insert_data_volume(dv);

        let mut pvc = create_test_claim("test", "Bound", &[(ANN_POPULATED_FOR, "test")]);
        pvc.metadata.owner_references = Some(vec![owner_reference(&dv)]);
        store.insert_pvc(pvc);
        dv
    }

    #[tokio::test]
    async fn test_garbage_collect_after_ttl() {
        let (store, _, ctrl) = setup();
        setup_succeeded(&store, 60, 90);

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert!(store.data_volume(&key()).is_none());

        let pvc = store.pvc(&key()).unwrap();
        assert_eq!(pvc.owner_references(), &[vm_owner()]);
        assert!(!has_annotation(&pvc, ANN_POPULATED_FOR));
        assert_eq!(annotation(&pvc, ANN_GARBAGE_COLLECTED), Some("true"));
    }

    #[tokio::test]
    async fn test_garbage_collect_requeues_before_ttl() {
        let (store, _, ctrl) = setup();
        setup_succeeded(&store, 120, 90);

        let result = reconcile_key(&ctrl, &key()).await.unwrap();
        let after = result.requeue_after.expect("should requeue until the TTL expires");
        assert!(after <= Duration::from_secs(30));
        assert!(after > Duration::from_secs(20));
        assert!(store.data_volume(&key()).is_some());
    }

    #[tokio::test]
    async fn test_garbage_collect_blocked_by_owner() {
        let (store, _, ctrl) = setup();
        setup_succeeded(&store, 60, 90);
        store.deny_finalizer_updates("vm-uid");

        reconcile_key(&ctrl, &key()).await.unwrap();
        assert!(store.data_volume(&key()).is_some());
        assert!(has_annotation(&store.pvc(&key()).unwrap(), ANN_POPULATED_FOR));
    }
}
