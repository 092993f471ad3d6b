//! Face analysis capability seam.
//!
//! The pipeline only needs one operation: given an image, return the faces
//! in it with bounding boxes, embeddings and detection scores. The shipped
//! implementation runs ONNX models (see [`onnx`]); tests inject fakes.

pub mod onnx;

use anyhow::Result;
use image::DynamicImage;

use crate::db::BoundingBox;

/// A detected face with bounding box and embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Face detection + embedding extraction.
///
/// Implementations are thread-affine: each worker thread owns its own
/// instance, so model state is never shared across threads.
pub trait FaceAnalyzer: Send {
    fn detect_and_embed(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Creates one analyzer per worker thread.
pub trait AnalyzerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>>;
}
