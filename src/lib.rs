//! datavolume-controller: Kubernetes controller for CDI DataVolumes
//!
//! This crate reconciles DataVolume custom resources into populated
//! PersistentVolumeClaims, driving import, upload, clone and external
//! population through claim annotations and populator sources.

pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "metrics")]
pub mod server;

pub use crate::error::{Error, Result};
