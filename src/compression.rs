use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, Rgb, RgbImage};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn size_mb(len: usize) -> f64 {
    len as f64 / BYTES_PER_MB
}

/// Shrinks a payload. `Ok(None)` means the compressor had nothing useful to
/// offer (already optimal, or the result was not smaller).
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Downscale and re-encode images as JPEG.
#[derive(Debug, Clone)]
pub struct ImageCompressor {
    quality: u8,
    max_width: u32,
    max_height: u32,
}

impl ImageCompressor {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_width: 1920,
            max_height: 1080,
        }
    }

    pub fn compress_blocking(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let img = image::load_from_memory(data).context("Failed to decode image")?;
        let (width, height) = img.dimensions();

        let img = if width > self.max_width || height > self.max_height {
            // `resize` keeps the aspect ratio and fits within the bounds
            img.resize(self.max_width, self.max_height, FilterType::Lanczos3)
        } else {
            img
        };

        let rgb = flatten_on_white(&img);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .context("Failed to encode JPEG")?;

        debug!(
            original = data.len(),
            compressed = out.len(),
            "Image re-encoded"
        );

        if out.len() < data.len() {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl Compressor for ImageCompressor {
    async fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let this = self.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || this.compress_blocking(&data))
            .await
            .context("Image compression task panicked")?
    }
}

/// Composite any transparency onto a white background.
pub fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(out.into_inner())
}

/// Runs an external ffmpeg binary over an in-memory payload, staging input
/// and output through uniquely named temp files.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: String,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(config: &ReplicationConfig, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: config.ffmpeg_path.clone(),
            temp_dir: temp_dir.into(),
            timeout: Duration::from_secs(config.ffmpeg_timeout_secs),
        }
    }

    /// True when the configured ffmpeg binary can be executed.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Write `data` to a temp file, run ffmpeg with the arguments built from
    /// the (input, output) paths and return the output file's bytes.
    /// Temp files are removed on every path.
    pub async fn transcode<F>(&self, data: &[u8], label: &str, args: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&Path, &Path) -> Vec<OsString> + Send,
    {
        let id = uuid::Uuid::new_v4();
        let input = self.temp_dir.join(format!("{label}_in_{id}.bin"));
        let output = self.temp_dir.join(format!("{label}_out_{id}.mp4"));
        let args = args(&input, &output);

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.temp_dir.display()))?;

        let result = match tokio::fs::write(&input, data)
            .await
            .context("Failed to write ffmpeg input file")
        {
            Ok(()) => match self.run(&args).await {
                Ok(()) => tokio::fs::read(&output)
                    .await
                    .context("Failed to read ffmpeg output"),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        for path in [&input, &output] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }

        result
    }

    async fn run(&self, args: &[OsString]) -> Result<()> {
        let child = Command::new(&self.path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let result = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| format!("ffmpeg timed out after {}s", self.timeout.as_secs()))?
            .context("Failed to run ffmpeg")?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .join(" | ");
            bail!("ffmpeg exited with {}: {}", result.status, tail);
        }
        Ok(())
    }
}

/// Re-encode video to H.264 at a lower resolution.
#[derive(Debug, Clone)]
pub struct VideoCompressor {
    ffmpeg: Ffmpeg,
    crf: u8,
}

impl VideoCompressor {
    pub fn new(ffmpeg: Ffmpeg, crf: u8) -> Self {
        Self { ffmpeg, crf }
    }
}

fn compress_args(input: &Path, output: &Path, crf: u8) -> Vec<OsString> {
    let crf = crf.to_string();
    let mut args: Vec<OsString> = vec!["-i".into(), input.into()];
    args.extend(
        [
            "-c:v",
            "libx264",
            "-crf",
            crf.as_str(),
            "-preset",
            "medium",
            "-vf",
            "scale=-2:'min(720,ih)'",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-movflags",
            "+faststart",
            "-y",
        ]
        .map(OsString::from),
    );
    args.push(output.into());
    args
}

#[async_trait]
impl Compressor for VideoCompressor {
    async fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let crf = self.crf;
        let compressed = self
            .ffmpeg
            .transcode(data, "video", move |input, output| compress_args(input, output, crf))
            .await?;
        info!(
            original_mb = size_mb(data.len()),
            compressed_mb = size_mb(compressed.len()),
            "Video re-encoded"
        );
        Ok(Some(compressed))
    }
}

/// Result of passing a payload through the size ceiling.
#[derive(Debug, PartialEq)]
pub enum GateOutcome {
    Accepted {
        bytes: Vec<u8>,
        /// Original length when the payload was replaced by a compressed one
        compressed_from: Option<usize>,
    },
    Rejected {
        size_mb: f64,
    },
}

/// Enforces the attachment size ceiling, compressing when allowed.
#[derive(Debug, Clone)]
pub struct SizeGate {
    max_file_size_mb: f64,
    auto_compress: bool,
}

impl SizeGate {
    pub fn new(max_file_size_mb: f64, auto_compress: bool) -> Self {
        Self {
            max_file_size_mb,
            auto_compress,
        }
    }

    pub fn max_file_size_mb(&self) -> f64 {
        self.max_file_size_mb
    }

    pub fn fits(&self, len: usize) -> bool {
        size_mb(len) <= self.max_file_size_mb
    }

    pub async fn admit(&self, bytes: Vec<u8>, compressor: Option<&dyn Compressor>) -> GateOutcome {
        if self.fits(bytes.len()) {
            return GateOutcome::Accepted {
                bytes,
                compressed_from: None,
            };
        }

        let original_mb = size_mb(bytes.len());
        let compressor = match compressor {
            Some(c) if self.auto_compress => c,
            _ => return GateOutcome::Rejected { size_mb: original_mb },
        };

        match compressor.compress(&bytes).await {
            Ok(Some(smaller)) if self.fits(smaller.len()) => {
                info!(
                    original_mb,
                    compressed_mb = size_mb(smaller.len()),
                    "Payload compressed under the size ceiling"
                );
                GateOutcome::Accepted {
                    compressed_from: Some(bytes.len()),
                    bytes: smaller,
                }
            }
            Ok(Some(smaller)) => {
                debug!(
                    compressed_mb = size_mb(smaller.len()),
                    "Compressed payload still over the ceiling"
                );
                GateOutcome::Rejected { size_mb: original_mb }
            }
            Ok(None) => GateOutcome::Rejected { size_mb: original_mb },
            Err(e) => {
                warn!(error = %e, "Compression failed, treating as unavailable");
                GateOutcome::Rejected { size_mb: original_mb }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    struct FixedCompressor(usize);

    #[async_trait]
    impl Compressor for FixedCompressor {
        async fn compress(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(Some(vec![0u8; self.0]))
        }
    }

    struct BrokenCompressor;

    #[async_trait]
    impl Compressor for BrokenCompressor {
        async fn compress(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> {
            bail!("decoder exploded")
        }
    }

    const MB: usize = 1024 * 1024;

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let h = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503))
                .wrapping_mul(2_246_822_519);
            let [r, g, b, _] = h.to_le_bytes();
            Rgba([r, g, b, 255])
        });
        encode_png(&DynamicImage::ImageRgba8(img)).unwrap()
    }

    #[test]
    fn test_size_mb() {
        assert_eq!(size_mb(MB), 1.0);
        assert_eq!(size_mb(0), 0.0);
    }

    #[tokio::test]
    async fn test_gate_accepts_small_payload_untouched() {
        let gate = SizeGate::new(25.0, true);
        let outcome = gate.admit(vec![1u8; 10 * MB], None).await;
        match outcome {
            GateOutcome::Accepted {
                bytes,
                compressed_from,
            } => {
                assert_eq!(bytes.len(), 10 * MB);
                assert!(compressed_from.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gate_exact_ceiling_is_accepted() {
        let gate = SizeGate::new(25.0, false);
        let outcome = gate.admit(vec![0u8; 25 * MB], None).await;
        assert!(matches!(outcome, GateOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_gate_compresses_under_ceiling() {
        let gate = SizeGate::new(25.0, true);
        let compressor = FixedCompressor(8 * MB);
        let outcome = gate.admit(vec![0u8; 40 * MB], Some(&compressor)).await;
        assert_eq!(
            outcome,
            GateOutcome::Accepted {
                bytes: vec![0u8; 8 * MB],
                compressed_from: Some(40 * MB),
            }
        );
    }

    #[tokio::test]
    async fn test_gate_rejects_when_still_too_large() {
        let gate = SizeGate::new(25.0, true);
        let compressor = FixedCompressor(30 * MB);
        let outcome = gate.admit(vec![0u8; 40 * MB], Some(&compressor)).await;
        assert_eq!(outcome, GateOutcome::Rejected { size_mb: 40.0 });
    }

    #[tokio::test]
    async fn test_gate_rejects_when_compression_disabled() {
        let gate = SizeGate::new(25.0, false);
        let compressor = FixedCompressor(MB);
        let outcome = gate.admit(vec![0u8; 30 * MB], Some(&compressor)).await;
        assert_eq!(outcome, GateOutcome::Rejected { size_mb: 30.0 });
    }

    #[tokio::test]
    async fn test_gate_compression_error_is_rejection() {
        let gate = SizeGate::new(25.0, true);
        let outcome = gate.admit(vec![0u8; 26 * MB], Some(&BrokenCompressor)).await;
        assert_eq!(outcome, GateOutcome::Rejected { size_mb: 26.0 });
    }

    #[test]
    fn test_image_compressor_downscales_large_image() {
        let png = noisy_png(2400, 1600);
        let compressed = ImageCompressor::new(75)
            .compress_blocking(&png)
            .unwrap()
            .expect("re-encoded JPEG should be smaller than noisy PNG");

        assert!(compressed.len() < png.len());
        let decoded = image::load_from_memory(&compressed).unwrap();
        assert!(decoded.width() <= 1920);
        assert!(decoded.height() <= 1080);
        assert_eq!(decoded.height(), 1080);
    }

    #[test]
    fn test_image_compressor_rejects_garbage() {
        let result = ImageCompressor::new(75).compress_blocking(b"not an image at all");
        assert!(result.is_err());
    }

    #[test]
    fn test_flatten_on_white() {
        let img = ImageBuffer::from_pixel(2, 2, Rgba([0u8, 0, 0, 0]));
        let flat = flatten_on_white(&DynamicImage::ImageRgba8(img));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    fn missing_ffmpeg(temp_dir: &Path) -> Ffmpeg {
        let config = ReplicationConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ..ReplicationConfig::default()
        };
        Ffmpeg::new(&config, temp_dir)
    }

    #[test]
    fn test_compress_args_order() {
        let args = compress_args(Path::new("in.bin"), Path::new("out.mp4"), 28);
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "in.bin");
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "28"));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[tokio::test]
    async fn test_transcode_without_ffmpeg_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = missing_ffmpeg(dir.path());
        assert!(!ffmpeg.is_available().await);

        let result = ffmpeg
            .transcode(b"video", "video", |input, output| {
                vec![input.into(), output.into()]
            })
            .await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
