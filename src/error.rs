//! Error types for the DataVolume controller

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("storageclass.storage.k8s.io \"{0}\" not found")]
    StorageClassNotFound(String),

    /// No class named, no default class, and no access modes to go on
    #[error("DataVolume.storage spec is missing accessMode and no storageClass to choose profile")]
    NoDefaultStorageClass,

    /// The PVC exists but is not controlled by the DataVolume
    #[error("Resource \"{0}\" already exists and is not managed by DataVolume")]
    ResourceExists(String),

    #[error("Resource \"{0}\" marked for deletion")]
    ResourceMarkedForDeletion(String),

    #[error("PVC {pvc} bound to unexpected PV {pv}")]
    UnexpectedPersistentVolume { pvc: String, pv: String },

    #[error("Invalid DataVolume spec: {0}")]
    InvalidSpec(String),

    /// Programmer error: a stage touched state it does not own
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether the controller should retry quickly
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::HttpError(_) => true,
            Error::ResourceMarkedForDeletion(_) => true,
            Error::SerializationError(_)
            | Error::StorageClassNotFound(_)
            | Error::NoDefaultStorageClass
            | Error::ResourceExists(_)
            | Error::UnexpectedPersistentVolume { .. }
            | Error::InvalidSpec(_)
            | Error::InvariantViolation(_)
            | Error::ConfigError(_) => false,
        }
    }

    /// Short label for the error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::HttpError(_) => "http",
            Error::StorageClassNotFound(_) => "storage_class_not_found",
            Error::NoDefaultStorageClass => "no_default_storage_class",
            Error::ResourceExists(_) => "resource_exists",
            Error::ResourceMarkedForDeletion(_) => "resource_marked_for_deletion",
            Error::UnexpectedPersistentVolume { .. } => "unexpected_pv",
            Error::InvalidSpec(_) => "invalid_spec",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::ConfigError(_) => "config",
        }
    }

    /// Resource quota rejections surface as 403 with an "exceeded quota:" message
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae))
            if ae.code == 403 && ae.message.contains("exceeded quota:"))
    }

    /// Errors resolved by a StorageClass or StorageProfile appearing, not by retrying
    pub fn waits_for_storage_class(&self) -> bool {
        matches!(
            self,
            Error::StorageClassNotFound(_) | Error::NoDefaultStorageClass
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists")
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "Conflict")
    }
}

/// Build an API error with the given code, as the apiserver would report it
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_detection() {
        let err = api_error(
            403,
            "Forbidden",
            "persistentvolumeclaims \"dv\" is forbidden: exceeded quota: storage",
        );
        assert!(err.is_quota_exceeded());
        assert!(!api_error(403, "Forbidden", "denied").is_quota_exceeded());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(api_error(409, "Conflict", "stale").is_retriable());
        assert!(api_error(500, "InternalError", "boom").is_retriable());
        assert!(!api_error(422, "Invalid", "bad").is_retriable());
        assert!(!Error::InvariantViolation("x".into()).is_retriable());
        assert!(Error::ResourceMarkedForDeletion("dv".into()).is_retriable());
    }

    #[test]
    fn test_conflict_vs_already_exists() {
        assert!(api_error(409, "Conflict", "stale").is_conflict());
        assert!(!api_error(409, "Conflict", "stale").is_already_exists());
        assert!(api_error(409, "AlreadyExists", "dup").is_already_exists());
        assert!(api_error(404, "NotFound", "gone").is_not_found());
    }
}
