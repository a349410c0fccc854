//! Transfer progress scraping
//!
//! Worker pods expose Prometheus text on a container port named `metrics`.
//! The scrape is advisory: the reconcile never fails because of it.

use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::error::{Error, Result};

use super::annotations::LABEL_CLONE_UNIQUE_ID;

const METRICS_PORT_NAME: &str = "metrics";
const CLONER_SOURCE_POD_SUFFIX: &str = "-source-pod";
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared scrape client. Worker pods serve self-signed certificates.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(SCRAPE_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            debug!("Falling back to default scrape client: {}", e);
            Client::new()
        })
});

/// Metrics endpoint of a worker pod, `None` when it has no IP or metrics port
pub fn metrics_url(pod: &Pod) -> Option<String> {
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    let port = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(METRICS_PORT_NAME))?
        .container_port;

    let host = match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]", ip),
        _ => ip.to_string(),
    };
    Some(format!("https://{}:{}/metrics", host, port))
}

/// Extract the progress value reported for `owner_uid`
pub fn parse_progress(body: &str, owner_uid: &str) -> Option<f64> {
    let pattern = format!(
        r#"progress\{{ownerUID="{}"\}} (\d{{1,3}}\.?\d*)"#,
        regex::escape(owner_uid)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}

/// Status representation of a progress value
pub fn format_progress(value: f64) -> String {
    format!("{:.2}%", value)
}

/// Scrape one endpoint and return the formatted progress, if reported
pub async fn fetch_progress(url: &str, owner_uid: &str) -> Result<Option<String>> {
    let body = HTTP_CLIENT
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(Error::HttpError)?
        .text()
        .await?;
    Ok(parse_progress(&body, owner_uid).map(format_progress))
}

/// Worker pod populating a claim: owned by it, or the clone source pod
pub fn find_worker_pod<'a>(pods: &'a [Pod], pvc: &PersistentVolumeClaim) -> Option<&'a Pod> {
    let uid = pvc.metadata.uid.as_deref()?;
    let clone_source_id = format!("{}{}", uid, CLONER_SOURCE_POD_SUFFIX);

    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .find(|pod| {
            pod.owner_references().iter().any(|r| r.uid == uid)
                || pod.labels().get(LABEL_CLONE_UNIQUE_ID) == Some(&clone_source_id)
        })
}

pub fn pod_is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::api::ObjectMeta;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UID: &str = "b856691e-1038-11e9-a5ab-525500d15501";

    fn pod(ip: &str, port_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("importer".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "importer".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some(port_name.to_string()),
                        container_port: 8443,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_metrics_url() {
        assert_eq!(
            metrics_url(&pod("10.0.0.7", "metrics")).as_deref(),
            Some("https://10.0.0.7:8443/metrics")
        );
        assert_eq!(
            metrics_url(&pod("fd00::7", "metrics")).as_deref(),
            Some("https://[fd00::7]:8443/metrics")
        );
        assert_eq!(metrics_url(&pod("10.0.0.7", "http")), None);
    }

    #[test]
    fn test_parse_progress() {
        let body = format!(
            "# TYPE import_progress gauge\nimport_progress{{ownerUID=\"other\"}} 99\nimport_progress{{ownerUID=\"{}\"}} 13.45\n",
            UID
        );
        assert_eq!(parse_progress(&body, UID), Some(13.45));
        assert_eq!(parse_progress(&body, "missing"), None);
        assert_eq!(format_progress(13.45), "13.45%");
        assert_eq!(format_progress(100.0), "100.00%");
    }

    #[test]
    fn test_find_worker_pod() {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                uid: Some("pvc-uid".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut owned = pod("10.0.0.1", "metrics");
        owned.metadata.owner_references = Some(vec![OwnerReference {
            uid: "pvc-uid".to_string(),
            ..Default::default()
        }]);
        let mut source = pod("10.0.0.2", "metrics");
        source.metadata.labels = Some(
            [(
                LABEL_CLONE_UNIQUE_ID.to_string(),
                "pvc-uid-source-pod".to_string(),
            )]
            .into(),
        );

        let pods = vec![pod("10.0.0.3", "metrics"), source];
        assert_eq!(
            find_worker_pod(&pods, &pvc).and_then(|p| p.status.as_ref()?.pod_ip.clone()),
            Some("10.0.0.2".to_string())
        );

        let mut deleting = owned.clone();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(find_worker_pod(&[deleting], &pvc).is_none());
        assert!(find_worker_pod(&[owned], &pvc).is_some());
    }

    #[tokio::test]
    async fn test_fetch_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "clone_progress{{ownerUID=\"{}\"}} 42.5\n",
                UID
            )))
            .mount(&server)
            .await;

        let url = format!("{}/metrics", server.uri());
        assert_eq!(
            fetch_progress(&url, UID).await.unwrap(),
            Some("42.50%".to_string())
        );
        assert_eq!(fetch_progress(&url, "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_progress_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = format!("{}/metrics", server.uri());
        assert!(fetch_progress(&url, UID).await.is_err());
    }
}
