use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::platform::{DocumentAttribute, IncomingMessage, Media};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "aac", "flac"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Which handler a message is sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Text,
    Pdf,
    Audio,
    Video,
    Image,
    Document,
    Other,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Text => "text",
            Route::Pdf => "pdf",
            Route::Audio => "audio",
            Route::Video => "video",
            Route::Image => "image",
            Route::Document => "document",
            Route::Other => "other",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the handler for a message. Pure function of the message's media.
pub fn classify(msg: &IncomingMessage) -> Route {
    match &msg.media {
        None => Route::Text,
        Some(media) => classify_media(media),
    }
}

pub fn classify_media(media: &Media) -> Route {
    // Documents carrying a video MIME type are videos whatever their tag says.
    if let Media::Document {
        mime: Some(mime), ..
    } = media
    {
        if mime.starts_with("video/") {
            return Route::Video;
        }
    }

    match media {
        Media::Photo { .. } => Route::Image,
        Media::Video { .. } => Route::Video,
        Media::Audio { .. } => Route::Audio,
        Media::Document {
            mime, attributes, ..
        } => classify_document(mime.as_deref(), media.filename(), attributes),
        Media::Other { .. } => Route::Other,
    }
}

fn classify_document(
    mime: Option<&str>,
    filename: Option<&str>,
    attributes: &[DocumentAttribute],
) -> Route {
    if let Some(mime) = mime {
        if mime.starts_with("audio/") {
            return Route::Audio;
        }
        if mime.starts_with("image/") {
            return Route::Image;
        }
        if mime == "application/pdf" {
            return Route::Pdf;
        }
    }

    if let Some(ext) = filename.and_then(extension_of) {
        let ext = ext.as_str();
        if AUDIO_EXTENSIONS.contains(&ext) {
            return Route::Audio;
        }
        if VIDEO_EXTENSIONS.contains(&ext) {
            return Route::Video;
        }
        if IMAGE_EXTENSIONS.contains(&ext) {
            return Route::Image;
        }
        if ext == "pdf" {
            return Route::Pdf;
        }
    }

    for attr in attributes {
        match attr {
            DocumentAttribute::Audio => return Route::Audio,
            DocumentAttribute::Video => return Route::Video,
            DocumentAttribute::Animated => {}
        }
    }

    Route::Document
}

/// Lowercased extension of a filename, without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Static mapping of source chat id to destination webhook URL.
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    webhooks: HashMap<i64, String>,
}

impl RouteTable {
    pub fn new(webhooks: HashMap<i64, String>) -> Self {
        Self { webhooks }
    }

    pub fn webhook_for(&self, chat_id: i64) -> Option<&str> {
        self.webhooks.get(&chat_id).map(String::as_str)
    }

    pub fn contains(&self, chat_id: i64) -> bool {
        self.webhooks.contains_key(&chat_id)
    }

    pub fn len(&self) -> usize {
        self.webhooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty()
    }

    /// Chat ids in ascending order.
    pub fn chat_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.webhooks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RemoteFile;

    fn document(mime: Option<&str>, filename: Option<&str>, attributes: Vec<DocumentAttribute>) -> Media {
        Media::Document {
            file: RemoteFile::new("doc", 1024),
            mime: mime.map(String::from),
            filename: filename.map(String::from),
            attributes,
        }
    }

    #[test]
    fn test_text_message_routes_to_text() {
        let msg = IncomingMessage {
            chat_id: -100123,
            text: Some("hello".to_string()),
            media: None,
        };
        assert_eq!(classify(&msg), Route::Text);
    }

    #[test]
    fn test_video_mime_document_routes_to_video() {
        let media = document(
            Some("video/mp4"),
            Some("notes.pdf"),
            vec![DocumentAttribute::Audio],
        );
        assert_eq!(classify_media(&media), Route::Video);
    }

    #[test]
    fn test_pdf_by_mime_and_by_extension() {
        assert_eq!(
            classify_media(&document(Some("application/pdf"), None, vec![])),
            Route::Pdf
        );
        assert_eq!(
            classify_media(&document(
                Some("application/octet-stream"),
                Some("Report.PDF"),
                vec![]
            )),
            Route::Pdf
        );
    }

    #[test]
    fn test_document_extensions() {
        assert_eq!(
            classify_media(&document(None, Some("song.flac"), vec![])),
            Route::Audio
        );
        assert_eq!(
            classify_media(&document(None, Some("movie.mkv"), vec![])),
            Route::Video
        );
        assert_eq!(
            classify_media(&document(None, Some("scan.webp"), vec![])),
            Route::Image
        );
    }

    #[test]
    fn test_document_attributes_are_last_resort() {
        assert_eq!(
            classify_media(&document(None, None, vec![DocumentAttribute::Audio])),
            Route::Audio
        );
        assert_eq!(
            classify_media(&document(None, Some("blob.bin"), vec![DocumentAttribute::Video])),
            Route::Video
        );
    }

    #[test]
    fn test_unknown_document_is_generic() {
        assert_eq!(
            classify_media(&document(Some("application/zip"), Some("a.zip"), vec![])),
            Route::Document
        );
    }

    #[test]
    fn test_photo_and_other() {
        assert_eq!(
            classify_media(&Media::Photo {
                file: RemoteFile::new("p", 1)
            }),
            Route::Image
        );
        assert_eq!(
            classify_media(&Media::Other {
                kind: "poll".to_string()
            }),
            Route::Other
        );
    }

    #[test]
    fn test_route_table_lookup() {
        let mut map = HashMap::new();
        map.insert(-100123, "https://discord.test/w".to_string());
        map.insert(-42, "https://discord.test/x".to_string());
        let table = RouteTable::new(map);

        assert_eq!(table.webhook_for(-100123), Some("https://discord.test/w"));
        assert!(table.webhook_for(7).is_none());
        assert_eq!(table.chat_ids(), vec![-100123, -42]);
    }
}
