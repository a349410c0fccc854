//! Wire-format tests for the DataVolume resources

#[cfg(test)]
mod data_volume_wire_format {
    use crate::crd::{
        CDIConfig, CDIConfigSpec, CDIConfigStatus, DataVolume, DataVolumePhase, DataVolumeSource,
        FilesystemOverhead,
    };
    use kube::CustomResourceExt;
    use serde_json::json;

    #[test]
    fn test_unset_phase_serializes_empty() {
        let status = crate::crd::DataVolumeStatus::default();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], json!(""));
        assert_eq!(value["restartCount"], json!(0));
    }

    #[test]
    fn test_parse_http_import() {
        let dv: DataVolume = serde_json::from_value(json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "DataVolume",
            "metadata": {"name": "test", "namespace": "default"},
            "spec": {
                "source": {"http": {"url": "http://example.com/disk.img"}},
                "storage": {"resources": {"requests": {"storage": "1Gi"}}}
            },
            "status": {"phase": "ImportInProgress", "progress": "45.00%"}
        }))
        .unwrap();

        assert!(matches!(dv.spec.source, Some(DataVolumeSource::Http(ref h)) if h.url == "http://example.com/disk.img"));
        assert_eq!(dv.phase(), DataVolumePhase::ImportInProgress);
        assert!(!dv.uses_external_populator());
    }

    #[test]
    fn test_blank_source_round_trips_as_object() {
        let dv: DataVolume = serde_json::from_value(json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "DataVolume",
            "metadata": {"name": "blank"},
            "spec": {"source": {"blank": {}}}
        }))
        .unwrap();
        let value = serde_json::to_value(&dv).unwrap();
        assert_eq!(value["spec"]["source"], json!({"blank": {}}));
        assert_eq!(dv.phase(), DataVolumePhase::Unset);
    }

    #[test]
    fn test_external_populator_detection() {
        let dv: DataVolume = serde_json::from_value(json!({
            "apiVersion": "cdi.kubevirt.io/v1beta1",
            "kind": "DataVolume",
            "metadata": {"name": "ext"},
            "spec": {
                "pvc": {
                    "dataSourceRef": {"apiGroup": "populator.example.io", "kind": "Sample", "name": "s"}
                }
            }
        }))
        .unwrap();
        assert!(dv.uses_external_populator());
    }

    #[test]
    fn test_filesystem_overhead_lookup() {
        let mut config = CDIConfig::new("config", CDIConfigSpec::default());
        assert_eq!(config.filesystem_overhead_for(Some("fast")), 0.0);

        config.status = Some(CDIConfigStatus {
            filesystem_overhead: Some(FilesystemOverhead {
                global: Some("0.055".to_string()),
                storage_class: [("fast".to_string(), "0.1".to_string())].into(),
            }),
        });
        assert_eq!(config.filesystem_overhead_for(Some("fast")), 0.1);
        assert_eq!(config.filesystem_overhead_for(Some("slow")), 0.055);
        assert_eq!(config.filesystem_overhead_for(None), 0.055);
    }

    #[test]
    fn test_crd_metadata() {
        let crd = DataVolume::crd();
        assert_eq!(crd.spec.group, "cdi.kubevirt.io");
        assert_eq!(crd.spec.names.kind, "DataVolume");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(CDIConfig::crd().spec.scope, "Cluster");
    }
}
