use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView};
use tracing::{debug, info, warn};

use crate::compression::{encode_png, Ffmpeg};
use crate::config::{WatermarkConfig, WatermarkPosition};

const MARGIN: u32 = 10;
const VIDEO_CRF: u8 = 23;

/// Applies text prefixes/suffixes and an optional logo overlay.
/// A failure while watermarking never blocks a message: the unmodified
/// payload is used instead.
#[derive(Debug, Clone, Default)]
pub struct Watermarker {
    enabled: bool,
    prefix: Option<String>,
    suffix: Option<String>,
    logo: Option<DynamicImage>,
    logo_path: Option<PathBuf>,
    position: WatermarkPosition,
    opacity: f32,
    video: bool,
    ffmpeg: Option<Ffmpeg>,
}

impl Watermarker {
    /// Build from config, loading the logo from disk when one is configured.
    pub fn new(config: &WatermarkConfig) -> Self {
        let logo = if config.enabled {
            config.image_path.as_ref().and_then(|path| {
                match image::open(path).with_context(|| format!("Failed to load {}", path.display())) {
                    Ok(logo) => {
                        info!(path = %path.display(), "Watermark logo loaded");
                        Some(logo)
                    }
                    Err(e) => {
                        warn!(error = %e, "Image watermarks disabled");
                        None
                    }
                }
            })
        } else {
            None
        };
        Self::build(config, logo)
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_logo(config: &WatermarkConfig, logo: DynamicImage) -> Self {
        Self::build(config, Some(logo))
    }

    fn build(config: &WatermarkConfig, logo: Option<DynamicImage>) -> Self {
        let non_empty = |s: &Option<String>| s.as_ref().filter(|v| !v.trim().is_empty()).cloned();
        let logo_path = logo.as_ref().and(config.image_path.clone());
        Self {
            enabled: config.enabled,
            prefix: non_empty(&config.text_prefix),
            suffix: non_empty(&config.text_suffix),
            logo,
            logo_path,
            position: config.position,
            opacity: config.opacity.clamp(0.0, 1.0),
            video: config.video,
            ffmpeg: None,
        }
    }

    /// Enable video overlays through the given ffmpeg runner.
    pub fn with_ffmpeg(mut self, ffmpeg: Option<Ffmpeg>) -> Self {
        self.ffmpeg = ffmpeg;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn applies_to_images(&self) -> bool {
        self.enabled && self.logo.is_some()
    }

    pub fn applies_to_videos(&self) -> bool {
        self.applies_to_images() && self.video && self.logo_path.is_some() && self.ffmpeg.is_some()
    }

    /// Wrap text with the configured prefix and suffix.
    pub fn apply_text(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(prefix) = &self.prefix {
            parts.push(prefix);
        }
        if !text.is_empty() {
            parts.push(text);
        }
        if let Some(suffix) = &self.suffix {
            parts.push(suffix);
        }
        parts.join(" ")
    }

    /// Overlay the logo. Returns the input unchanged on any failure.
    pub fn apply_image(&self, data: Vec<u8>) -> Vec<u8> {
        if !self.applies_to_images() {
            return data;
        }
        match self.overlay(&data) {
            Ok(marked) => marked,
            Err(e) => {
                warn!(error = %e, "Image watermark failed, sending original");
                data
            }
        }
    }

    /// Burn the logo into a video with ffmpeg. Returns the input unchanged
    /// on any failure.
    pub async fn apply_video(&self, data: Vec<u8>) -> Vec<u8> {
        let (Some(ffmpeg), Some(logo)) = (&self.ffmpeg, &self.logo_path) else {
            return data;
        };
        if !self.applies_to_videos() {
            return data;
        }

        let logo = logo.clone();
        let (position, opacity) = (self.position, self.opacity);
        let result = ffmpeg
            .transcode(&data, "watermark", move |input, output| {
                overlay_args(input, output, &logo, position, opacity)
            })
            .await;

        match result {
            Ok(marked) if !marked.is_empty() => {
                debug!(bytes = marked.len(), "Video watermark applied");
                marked
            }
            Ok(_) => {
                warn!("ffmpeg produced an empty video, sending original");
                data
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Video watermark failed, sending original");
                data
            }
        }
    }

    fn overlay(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(logo) = &self.logo else {
            return Ok(data.to_vec());
        };
        let mut base = image::load_from_memory(data)
            .context("Failed to decode image")?
            .to_rgba8();

        let (bw, bh) = base.dimensions();
        let (lw, lh) = logo.dimensions();
        let logo = if lw > bw / 4 || lh > bh / 4 {
            logo.resize((bw / 4).max(1), (bh / 4).max(1), FilterType::Lanczos3)
        } else {
            logo.clone()
        };

        let mut logo = logo.to_rgba8();
        for px in logo.pixels_mut() {
            px.0[3] = (px.0[3] as f32 * self.opacity).round() as u8;
        }

        let (x, y) = corner(self.position, (bw, bh), logo.dimensions());
        imageops::overlay(&mut base, &logo, x as i64, y as i64);

        encode_png(&DynamicImage::ImageRgba8(base))
    }
}

/// Watermark settings per source chat, falling back to the global ones.
#[derive(Debug, Clone, Default)]
pub struct Watermarks {
    default: Arc<Watermarker>,
    groups: HashMap<i64, Arc<Watermarker>>,
}

impl Watermarks {
    pub fn new(default: Watermarker) -> Self {
        Self {
            default: Arc::new(default),
            groups: HashMap::new(),
        }
    }

    pub fn with_group(mut self, chat_id: i64, watermarker: Watermarker) -> Self {
        self.groups.insert(chat_id, Arc::new(watermarker));
        self
    }

    /// Load the global watermark and every `[watermark.groups]` override.
    pub fn from_config(config: &WatermarkConfig, ffmpeg: Option<Ffmpeg>) -> Self {
        let mut watermarks = Self::new(Watermarker::new(config).with_ffmpeg(ffmpeg.clone()));
        for (chat_id, group) in config.group_configs() {
            debug!(chat_id, enabled = group.enabled, "Watermark override loaded");
            watermarks = watermarks.with_group(
                chat_id,
                Watermarker::new(&group).with_ffmpeg(ffmpeg.clone()),
            );
        }
        watermarks
    }

    pub fn for_chat(&self, chat_id: i64) -> Arc<Watermarker> {
        Arc::clone(self.groups.get(&chat_id).unwrap_or(&self.default))
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Watermarker>> {
        std::iter::once(&self.default).chain(self.groups.values())
    }

    pub fn any_enabled(&self) -> bool {
        self.all().any(|w| w.is_enabled())
    }

    pub fn any_logo(&self) -> bool {
        self.all().any(|w| w.applies_to_images())
    }
}

fn corner(position: WatermarkPosition, base: (u32, u32), logo: (u32, u32)) -> (u32, u32) {
    let right = base.0.saturating_sub(logo.0 + MARGIN);
    let bottom = base.1.saturating_sub(logo.1 + MARGIN);
    match position {
        WatermarkPosition::TopLeft => (MARGIN, MARGIN),
        WatermarkPosition::TopRight => (right, MARGIN),
        WatermarkPosition::BottomLeft => (MARGIN, bottom),
        WatermarkPosition::BottomRight => (right, bottom),
    }
}

fn overlay_args(
    input: &Path,
    output: &Path,
    logo: &Path,
    position: WatermarkPosition,
    opacity: f32,
) -> Vec<OsString> {
    let m = MARGIN;
    let place = match position {
        WatermarkPosition::TopLeft => format!("{m}:{m}"),
        WatermarkPosition::TopRight => format!("W-w-{m}:{m}"),
        WatermarkPosition::BottomLeft => format!("{m}:H-h-{m}"),
        WatermarkPosition::BottomRight => format!("W-w-{m}:H-h-{m}"),
    };
    let filter = format!(
        "[1:v]format=rgba,colorchannelmixer=aa={opacity:.2}[wm];[0:v][wm]overlay={place}"
    );
    let crf = VIDEO_CRF.to_string();

    let mut args: Vec<OsString> = vec!["-i".into(), input.into(), "-i".into(), logo.into()];
    args.extend(
        [
            "-filter_complex",
            filter.as_str(),
            "-c:v",
            "libx264",
            "-crf",
            crf.as_str(),
            "-preset",
            "medium",
            "-c:a",
            "copy",
            "-movflags",
            "+faststart",
            "-y",
        ]
        .map(OsString::from),
    );
    args.push(output.into());
    args
}
