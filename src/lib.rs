//! facefan: a local-first event-photo pipeline.
//!
//! Photos dropped into `Incoming/` are normalized, scanned for faces,
//! clustered into per-person identities, fanned out into a `People/` folder
//! tree and mirrored to a remote object store. Guests enroll with a selfie,
//! which binds their name to a cluster and renames its folder everywhere.

pub mod analyzer;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod db;
pub mod enrollment;
pub mod logging;
pub mod phase;
pub mod processor;
pub mod router;
pub mod supervisor;
pub mod sync;
pub mod upload_queue;
pub mod watcher;
pub mod worker;

pub use analyzer::{AnalyzerFactory, DetectedFace, FaceAnalyzer};
pub use cloud::{CloudManager, RemoteError, RemoteStore};
pub use config::Config;
pub use db::{BoundingBox, Enrollment, Face, Person, Photo, PhotoStatus, Store, UploadJob, UploadStatus};
pub use enrollment::{EnrollError, EnrollRequest, Enrolled};
pub use phase::{Phase, PhaseCoordinator};
