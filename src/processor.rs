//! Image normalization, thumbnailing and face extraction.
//!
//! Turns one input file into a normalized JPEG plus a square thumbnail in
//! `Processed/`, and runs the face analyzer over the normalized image. RAW
//! camera files are developed with imagepipe; everything else decodes
//! through the image crate with the EXIF orientation applied first.

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::analyzer::{DetectedFace, FaceAnalyzer};
use crate::config::Config;

const JPEG_QUALITY: u8 = 95;
const THUMB_QUALITY: u8 = 85;

const RAW_EXTENSIONS: [&str; 8] = ["cr2", "nef", "arw", "dng", "orf", "rw2", "raf", "pef"];

pub fn is_raw_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .map(|e| RAW_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Result of processing a single photo.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub processed_path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    pub faces: Vec<DetectedFace>,
}

/// Develop a camera-RAW file into an RGB image.
fn develop_raw(path: &Path) -> Result<DynamicImage> {
    let mut pipeline = imagepipe::Pipeline::new_from_file(path)
        .map_err(|e| anyhow!("RAW decode failed for {:?}: {e}", path))?;
    let developed = pipeline
        .output_8bit(None)
        .map_err(|e| anyhow!("RAW develop failed for {:?}: {e}", path))?;
    let buffer = image::RgbImage::from_raw(
        developed.width as u32,
        developed.height as u32,
        developed.data,
    )
    .ok_or_else(|| anyhow!("RAW develop produced a malformed buffer for {:?}", path))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Read the EXIF orientation tag (1 when absent or unreadable).
fn exif_orientation(path: &Path) -> u32 {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return 1,
    };
    let mut reader = std::io::BufReader::new(&file);
    match exif::Reader::new().read_from_container(&mut reader) {
        Ok(data) => data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

/// Apply an EXIF orientation value (1..=8) so the image is upright.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Decode any supported input into an upright RGB image.
pub fn load_upright(path: &Path) -> Result<DynamicImage> {
    if is_raw_file(path) {
        // imagepipe applies the camera orientation during develop
        return develop_raw(path);
    }
    let img = image::open(path).with_context(|| format!("failed to decode {path:?}"))?;
    Ok(apply_orientation(img, exif_orientation(path)))
}

fn save_jpeg(img: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {path:?}"))?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    img.to_rgb8().write_with_encoder(encoder)?;
    Ok(())
}

/// Shrink so the longest edge fits `max_size`; smaller images pass through.
fn resize_to_fit(img: DynamicImage, max_size: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width.max(height) <= max_size {
        return img;
    }
    let ratio = max_size as f32 / width.max(height) as f32;
    img.resize(
        (width as f32 * ratio) as u32,
        (height as f32 * ratio) as u32,
        image::imageops::FilterType::Lanczos3,
    )
}

/// Center-cropped square thumbnail.
fn square_thumbnail(img: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let edge = width.min(height);
    let left = (width - edge) / 2;
    let top = (height - edge) / 2;
    img.crop_imm(left, top, edge, edge)
        .resize_exact(size, size, image::imageops::FilterType::Lanczos3)
}

/// Run the full per-photo transform: normalize, thumbnail, detect.
///
/// On error nothing is left behind in `Processed/` for this photo; a failed
/// thumbnail alone is logged and tolerated.
pub fn process_photo(
    input: &Path,
    photo_id: i64,
    analyzer: &mut dyn FaceAnalyzer,
    config: &Config,
) -> Result<ProcessOutcome> {
    if !config.is_supported_extension(input) {
        bail!("unsupported file type: {:?}", input);
    }

    let processed_dir = config.processed_dir();
    std::fs::create_dir_all(&processed_dir)?;

    let base = format!("{photo_id:06}");
    let processed_path = processed_dir.join(format!("{base}.jpg"));
    let thumbnail_path = processed_dir.join(format!("{base}_thumb.jpg"));

    let upright = load_upright(input)?;
    let normalized = resize_to_fit(upright, config.processing.max_image_size);
    save_jpeg(&normalized, &processed_path, JPEG_QUALITY)?;
    debug!(photo_id, path = ?processed_path, "normalized");

    let thumbnail = square_thumbnail(&normalized, config.processing.thumbnail_size);
    let thumbnail_path = match save_jpeg(&thumbnail, &thumbnail_path, THUMB_QUALITY) {
        Ok(()) => Some(thumbnail_path),
        Err(e) => {
            warn!(photo_id, error = %e, "thumbnail creation failed");
            None
        }
    };

    let faces = match analyzer.detect_and_embed(&normalized) {
        Ok(faces) => faces,
        Err(e) => {
            // Remove the partial outputs so a failed photo leaves no files
            let _ = std::fs::remove_file(&processed_path);
            if let Some(thumb) = &thumbnail_path {
                let _ = std::fs::remove_file(thumb);
            }
            return Err(e).context("face detection failed");
        }
    };
    debug!(photo_id, count = faces.len(), "detected faces");

    Ok(ProcessOutcome { processed_path, thumbnail_path, faces })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::fake::{face_at, FakeAnalyzer};
    use crate::db::BoundingBox;
    use image::RgbImage;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.event_root = root.to_path_buf();
        config.processing.max_image_size = 512;
        config.processing.thumbnail_size = 64;
        config
    }

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn raw_extension_detection() {
        assert!(is_raw_file(Path::new("shot.CR2")));
        assert!(is_raw_file(Path::new("shot.nef")));
        assert!(!is_raw_file(Path::new("shot.jpg")));
    }

    #[test]
    fn orientation_six_swaps_dimensions() {
        let img = DynamicImage::new_rgb8(40, 20);
        let rotated = apply_orientation(img, 6);
        assert_eq!(rotated.dimensions(), (20, 40));
    }

    #[test]
    fn resize_caps_longest_edge() {
        let img = DynamicImage::new_rgb8(1000, 500);
        let resized = resize_to_fit(img, 200);
        assert_eq!(resized.dimensions().0, 200);
        // Small images are untouched
        let small = DynamicImage::new_rgb8(100, 50);
        assert_eq!(resize_to_fit(small, 200).dimensions(), (100, 50));
    }

    #[test]
    fn thumbnail_is_square() {
        let img = DynamicImage::new_rgb8(300, 100);
        let thumb = square_thumbnail(&img, 64);
        assert_eq!(thumb.dimensions(), (64, 64));
    }

    #[test]
    fn process_photo_writes_outputs_and_reports_faces() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let input = dir.path().join("input.jpg");
        write_jpeg(&input, 800, 600);

        let mut analyzer = FakeAnalyzer::new(vec![vec![face_at(10, 10, vec![1.0, 0.0], 0.95)]]);
        let outcome = process_photo(&input, 7, &mut analyzer, &config).unwrap();

        assert_eq!(
            outcome.processed_path.file_name().unwrap().to_str().unwrap(),
            "000007.jpg"
        );
        assert!(outcome.processed_path.exists());
        let thumb = outcome.thumbnail_path.unwrap();
        assert!(thumb.ends_with("000007_thumb.jpg"));

        // Normalized output respects the size budget
        let processed = image::open(&outcome.processed_path).unwrap();
        assert!(processed.dimensions().0 <= 512 && processed.dimensions().1 <= 512);

        assert_eq!(outcome.faces.len(), 1);
        assert_eq!(outcome.faces[0].bbox, BoundingBox { x: 10, y: 10, width: 64, height: 64 });
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let input = dir.path().join("notes.txt");
        std::fs::write(&input, b"not an image").unwrap();

        let mut analyzer = FakeAnalyzer::new(vec![]);
        assert!(process_photo(&input, 1, &mut analyzer, &config).is_err());
    }

    #[test]
    fn decode_failure_leaves_no_partial_files() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"garbage bytes").unwrap();

        let mut analyzer = FakeAnalyzer::new(vec![]);
        assert!(process_photo(&input, 3, &mut analyzer, &config).is_err());
        assert!(!config.processed_dir().join("000003.jpg").exists());
    }
}
