//! Text shaping for Discord: chunking, captions and attachment filenames.

use chrono::{DateTime, Local};

use crate::routing::Route;

/// Discord rejects message content longer than this many characters.
pub const DISCORD_CONTENT_LIMIT: usize = 2000;

const MAX_STEM_CHARS: usize = 50;

/// Split text into chunks of at most `max_chars` characters, preferring to
/// break after a newline, then after a space.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());

        let cut = if end < rest.len() {
            rest[..end]
                .rfind('\n')
                .or_else(|| rest[..end].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}

/// Truncate to at most `max_chars` characters, marking the cut with "...".
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn icon(route: Route) -> &'static str {
    match route {
        Route::Pdf => "📄",
        Route::Audio => "🎵",
        Route::Video => "🎬",
        Route::Image => "🖼️",
        Route::Document => "📎",
        Route::Text | Route::Other => "💬",
    }
}

fn label(route: Route) -> &'static str {
    match route {
        Route::Pdf => "PDF",
        Route::Audio => "Audio",
        Route::Video => "Video",
        Route::Image => "Image",
        Route::Document => "Document",
        Route::Text => "Text",
        Route::Other => "Media",
    }
}

/// Header line plus the original caption, bounded by the Discord limit.
pub fn build_caption(route: Route, filename: &str, size_mb: f64, caption: &str) -> String {
    let mut out = format!(
        "{} **{}:** {} ({:.1} MB)",
        icon(route),
        label(route),
        filename,
        size_mb
    );
    if !caption.trim().is_empty() {
        out.push_str("\n\n");
        out.push_str(caption);
    }
    truncate_chars(&out, DISCORD_CONTENT_LIMIT)
}

pub fn build_audio_caption(
    filename: &str,
    size_mb: f64,
    format: AudioFormat,
    caption: &str,
) -> String {
    let mut out = format!(
        "{} **Audio:** {} ({:.1} MB, {}, ~{})",
        icon(Route::Audio),
        filename,
        size_mb,
        format.display_name(),
        estimate_duration(size_mb, format)
    );
    if !caption.trim().is_empty() {
        out.push_str("\n\n");
        out.push_str(caption);
    }
    truncate_chars(&out, DISCORD_CONTENT_LIMIT)
}

pub fn rejection_notice(route: Route, size_mb: f64, max_mb: f64, caption: &str) -> String {
    let mut out = format!(
        "⚠️ {} too large to replicate ({:.1} MB, limit {:.0} MB)",
        label(route),
        size_mb,
        max_mb
    );
    if !caption.trim().is_empty() {
        out.push_str("\n\n");
        out.push_str(caption);
    }
    truncate_chars(&out, DISCORD_CONTENT_LIMIT)
}

pub fn timeout_notice(route: Route, secs: u64) -> String {
    format!(
        "⏱️ {} processing timed out after {}s",
        label(route),
        secs
    )
}

pub fn error_notice(route: Route) -> String {
    format!("❌ Failed to replicate {}", label(route).to_lowercase())
}

pub fn other_media_notice(kind: &str, caption: &str) -> String {
    let mut out = format!("📎 Unsupported media shared: {}", kind);
    if !caption.trim().is_empty() {
        out.push_str("\n\n");
        out.push_str(caption);
    }
    truncate_chars(&out, DISCORD_CONTENT_LIMIT)
}

/// Audio container detected from the leading bytes of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Ogg,
    M4a,
    Unknown,
}

impl AudioFormat {
    pub fn sniff(data: &[u8]) -> Self {
        if data.len() < 12 {
            return AudioFormat::Unknown;
        }
        if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
            AudioFormat::Mp3
        } else if data.starts_with(b"RIFF") && &data[8..12] == b"WAVE" {
            AudioFormat::Wav
        } else if data.starts_with(b"OggS") {
            AudioFormat::Ogg
        } else if data[..12].windows(4).any(|w| w == b"ftyp") {
            AudioFormat::M4a
        } else {
            AudioFormat::Unknown
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 | AudioFormat::Unknown => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
            AudioFormat::M4a => "m4a",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::Wav => "WAV",
            AudioFormat::Ogg => "OGG",
            AudioFormat::M4a => "M4A",
            AudioFormat::Unknown => "audio",
        }
    }

    fn minutes_per_mb(&self) -> f64 {
        match self {
            AudioFormat::Mp3 | AudioFormat::M4a => 1.2,
            AudioFormat::Wav => 0.1,
            AudioFormat::Ogg | AudioFormat::Unknown => 0.8,
        }
    }
}

/// Rough playback length derived from size and container, e.g. "45s",
/// "3.6min" or "1.2h".
pub fn estimate_duration(size_mb: f64, format: AudioFormat) -> String {
    let minutes = size_mb * format.minutes_per_mb();
    if minutes < 1.0 {
        format!("{}s", (minutes * 60.0).round() as u64)
    } else if minutes < 60.0 {
        format!("{:.1}min", minutes)
    } else {
        format!("{:.1}h", minutes / 60.0)
    }
}

fn sanitize_stem(name: &str) -> String {
    let stem = match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    cleaned.trim_matches('_').to_string()
}

/// Attachment name for audio: sanitized stem, timestamp and sniffed extension.
pub fn smart_audio_filename(
    original: Option<&str>,
    format: AudioFormat,
    now: DateTime<Local>,
) -> String {
    let stem = original.map(sanitize_stem).unwrap_or_default();
    let stem = if stem.is_empty() { "audio" } else { stem.as_str() };
    format!("{}_{}.{}", stem, now.format("%H%M%S"), format.extension())
}

/// `<prefix>_<HHMMSS>.<ext>`
pub fn timestamped(prefix: &str, ext: &str, now: DateTime<Local>) -> String {
    format!("{}_{}.{}", prefix, now.format("%H%M%S"), ext)
}
