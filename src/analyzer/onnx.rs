//! ONNX-backed face analyzer: UltraFace for detection, ArcFace for
//! 512-dimensional embeddings.
//!
//! Model files are fetched once into the local data directory. Sessions are
//! owned by the analyzer instance, so one analyzer per worker thread gives
//! contention-free inference.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{AnalyzerFactory, DetectedFace, FaceAnalyzer};
use crate::db::BoundingBox;

const DETECTOR_FILE: &str = "ultraface-320.onnx";
const DETECTOR_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";
const EMBEDDER_FILE: &str = "arcface-resnet100.onnx";
const EMBEDDER_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

const DETECT_WIDTH: u32 = 320;
const DETECT_HEIGHT: u32 = 240;
const EMBED_SIZE: u32 = 112;
const CONFIDENCE_THRESHOLD: f32 = 0.7;
const NMS_THRESHOLD: f32 = 0.3;

fn models_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("could not determine local data directory"))?;
    let dir = data_dir.join("facefan").join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn ensure_model(filename: &str, url: &str) -> Result<PathBuf> {
    let path = models_dir()?.join(filename);
    if !path.exists() {
        tracing::info!(model = %filename, "downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("failed to download {filename}: {e}"))?;
        let mut file = std::fs::File::create(&path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        tracing::info!(model = %filename, path = ?path, "model downloaded");
    }
    Ok(path)
}

fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    Ok(session)
}

pub struct OnnxAnalyzer {
    detector: Session,
    embedder: Session,
    /// Inputs smaller than this on the long side are upscaled before
    /// detection; boxes are mapped back afterwards.
    min_detect_dim: u32,
}

impl OnnxAnalyzer {
    pub fn new() -> Result<Self> {
        let detector = load_session(&ensure_model(DETECTOR_FILE, DETECTOR_URL)?)?;
        let embedder = load_session(&ensure_model(EMBEDDER_FILE, EMBEDDER_URL)?)?;
        Ok(Self { detector, embedder, min_detect_dim: 640 })
    }

    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        let (orig_width, orig_height) = img.dimensions();

        let resized =
            img.resize_exact(DETECT_WIDTH, DETECT_HEIGHT, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();

        // NCHW tensor normalized to (-1, 1)
        let plane = (DETECT_WIDTH * DETECT_HEIGHT) as usize;
        let mut input = vec![0.0f32; 3 * plane];
        for y in 0..DETECT_HEIGHT as usize {
            for x in 0..DETECT_WIDTH as usize {
                let pixel = rgb.get_pixel(x as u32, y as u32);
                let idx = y * DETECT_WIDTH as usize + x;
                input[idx] = (pixel[0] as f32 - 127.0) / 128.0;
                input[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
                input[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
            }
        }

        let tensor = Tensor::from_array((
            [1usize, 3, DETECT_HEIGHT as usize, DETECT_WIDTH as usize],
            input.into_boxed_slice(),
        ))?;
        let outputs = self.detector.run(ort::inputs!["input" => tensor])?;

        let scores_value = outputs
            .get("scores")
            .ok_or_else(|| anyhow!("detector produced no scores output"))?;
        let boxes_value = outputs
            .get("boxes")
            .ok_or_else(|| anyhow!("detector produced no boxes output"))?;

        let (scores_shape, scores) = scores_value.try_extract_tensor::<f32>()?;
        let (_boxes_shape, boxes) = boxes_value.try_extract_tensor::<f32>()?;

        // scores: [1, anchors, 2], boxes: [1, anchors, 4] normalized corners
        let anchors = scores_shape[1] as usize;
        let mut candidates = Vec::new();
        for i in 0..anchors {
            let confidence = scores[i * 2 + 1];
            if confidence <= CONFIDENCE_THRESHOLD {
                continue;
            }
            let x1 = (boxes[i * 4] * orig_width as f32) as i32;
            let y1 = (boxes[i * 4 + 1] * orig_height as f32) as i32;
            let x2 = (boxes[i * 4 + 2] * orig_width as f32) as i32;
            let y2 = (boxes[i * 4 + 3] * orig_height as f32) as i32;
            candidates.push((
                BoundingBox {
                    x: x1.max(0),
                    y: y1.max(0),
                    width: (x2 - x1).max(1),
                    height: (y2 - y1).max(1),
                },
                confidence,
            ));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }

    fn embed(&mut self, face: &DynamicImage) -> Result<Vec<f32>> {
        let resized = face.resize_exact(EMBED_SIZE, EMBED_SIZE, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();

        let plane = (EMBED_SIZE * EMBED_SIZE) as usize;
        let mut input = vec![0.0f32; 3 * plane];
        for y in 0..EMBED_SIZE as usize {
            for x in 0..EMBED_SIZE as usize {
                let pixel = rgb.get_pixel(x as u32, y as u32);
                let idx = y * EMBED_SIZE as usize + x;
                input[idx] = (pixel[0] as f32 - 127.5) / 127.5;
                input[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
                input[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
            }
        }

        let tensor = Tensor::from_array((
            [1usize, 3, EMBED_SIZE as usize, EMBED_SIZE as usize],
            input.into_boxed_slice(),
        ))?;
        let outputs = self.embedder.run(ort::inputs!["data" => tensor])?;

        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("embedder produced no output"))?;
        let (_shape, data) = output.1.try_extract_tensor::<f32>()?;

        // L2-normalize
        let embedding: Vec<f32> = data.to_vec();
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            Ok(embedding.iter().map(|v| v / norm).collect())
        } else {
            Ok(embedding)
        }
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect_and_embed(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let (width, height) = image.dimensions();
        let long_side = width.max(height);

        // Tiny inputs produce silent zero-detections; upscale for detection
        // and map boxes back to the caller's coordinate space.
        let (detect_img, scale) = if long_side < self.min_detect_dim && long_side > 0 {
            let factor = self.min_detect_dim as f32 / long_side as f32;
            let upscaled = image.resize_exact(
                (width as f32 * factor) as u32,
                (height as f32 * factor) as u32,
                image::imageops::FilterType::CatmullRom,
            );
            (upscaled, factor)
        } else {
            (image.clone(), 1.0)
        };

        let boxes = self.detect(&detect_img)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for (scaled_bbox, confidence) in boxes {
            let bbox = if scale != 1.0 {
                BoundingBox {
                    x: (scaled_bbox.x as f32 / scale) as i32,
                    y: (scaled_bbox.y as f32 / scale) as i32,
                    width: ((scaled_bbox.width as f32 / scale) as i32).max(1),
                    height: ((scaled_bbox.height as f32 / scale) as i32).max(1),
                }
            } else {
                scaled_bbox
            };
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let crop = crop_face(image, &bbox, width, height);
            let embedding = self.embed(&crop)?;
            faces.push(DetectedFace { bbox, embedding, confidence });
        }

        Ok(faces)
    }
}

/// Factory handing a fresh analyzer to each worker thread.
pub struct OnnxAnalyzerFactory;

impl OnnxAnalyzerFactory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl AnalyzerFactory for OnnxAnalyzerFactory {
    fn create(&self) -> Result<Box<dyn FaceAnalyzer>> {
        Ok(Box::new(OnnxAnalyzer::new()?))
    }
}

/// Non-maximum suppression over (box, confidence) candidates.
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && iou(&boxes[i].0, &boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = (a.width * a.height + b.width * b.height) as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face region with 20% padding on each side.
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let pad_x = (bbox.width as f32 * 0.2) as i32;
    let pad_y = (bbox.height as f32 * 0.2) as i32;

    let x = (bbox.x - pad_x).max(0) as u32;
    let y = (bbox.y - pad_y).max(0) as u32;
    let w = ((bbox.width + pad_x * 2) as u32).min(img_width.saturating_sub(x));
    let h = ((bbox.height + pad_y * 2) as u32).min(img_height.saturating_sub(y));

    img.crop_imm(x, y, w.max(1), h.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 20, y: 20, width: 10, height: 10 };
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn nms_drops_heavy_overlaps() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 1, y: 1, width: 10, height: 10 };
        let c = BoundingBox { x: 50, y: 50, width: 10, height: 10 };
        let kept = nms(vec![(a, 0.9), (b, 0.8), (c, 0.7)], 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, a);
        assert_eq!(kept[1].0, c);
    }

    #[test]
    fn crop_face_clamps_to_image_bounds() {
        let img = DynamicImage::new_rgb8(100, 100);
        let bbox = BoundingBox { x: 90, y: 90, width: 20, height: 20 };
        let crop = crop_face(&img, &bbox, 100, 100);
        assert!(crop.width() <= 100);
        assert!(crop.height() <= 100);
    }
}
