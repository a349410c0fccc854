//! Kubernetes event recording
//!
//! Recording never blocks the reconcile: the Kubernetes recorder posts the
//! Event on a background task and only logs failures.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    client::Client,
    Resource,
};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::DataVolume;

// Reasons shared by all controllers
pub const REASON_ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const REASON_ERR_RESOURCE_MARKED_FOR_DELETION: &str = "ErrResourceMarkedForDeletion";
pub const REASON_ERR_CLAIM_LOST: &str = "ErrClaimLost";
pub const REASON_ERR_EXCEEDED_QUOTA: &str = "ErrExceededQuota";
pub const REASON_ERR_CLAIM_NOT_VALID: &str = "ErrClaimNotValid";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Records events against an object
#[cfg_attr(test, automock)]
pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Reference used as the involved object for DataVolume events
pub fn data_volume_ref(dv: &DataVolume) -> ObjectReference {
    dv.object_ref(&())
}

/// Recorder posting core/v1 Events through the API server
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    component: String,
}

impl KubeRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

impl EventRecorder for KubeRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let namespace = object
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = object.name.clone().unwrap_or_default();
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-event-", name)),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: object.clone(),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        };

        tokio::spawn(async move {
            if let Err(e) = events.create(&PostParams::default(), &event).await {
                warn!("Failed to record event for {}/{}: {}", namespace, name, e);
            }
        });
    }
}
