pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// Handle to a file stored on the source platform, downloaded on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    /// Size in bytes as reported by the platform (0 when unknown)
    pub size: u64,
}

impl RemoteFile {
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            size,
        }
    }
}

/// Extra hints attached to generic documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentAttribute {
    Audio,
    Video,
    Animated,
}

/// Media carried by a message, decided once when the message is ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Photo {
        file: RemoteFile,
    },
    Document {
        file: RemoteFile,
        mime: Option<String>,
        filename: Option<String>,
        attributes: Vec<DocumentAttribute>,
    },
    Video {
        file: RemoteFile,
        mime: Option<String>,
        filename: Option<String>,
    },
    Audio {
        file: RemoteFile,
        mime: Option<String>,
        filename: Option<String>,
    },
    /// Anything without a downloadable payload (stickers, polls, locations...)
    Other {
        kind: String,
    },
}

impl Media {
    pub fn file(&self) -> Option<&RemoteFile> {
        match self {
            Media::Photo { file }
            | Media::Document { file, .. }
            | Media::Video { file, .. }
            | Media::Audio { file, .. } => Some(file),
            Media::Other { .. } => None,
        }
    }

    /// Declared filename. Blank names count as missing.
    pub fn filename(&self) -> Option<&str> {
        match self {
            Media::Document { filename, .. }
            | Media::Video { filename, .. }
            | Media::Audio { filename, .. } => {
                filename.as_deref().filter(|name| !name.trim().is_empty())
            }
            Media::Photo { .. } | Media::Other { .. } => None,
        }
    }

    /// Short human label used in notifications.
    pub fn kind(&self) -> &str {
        match self {
            Media::Photo { .. } => "photo",
            Media::Document { .. } => "document",
            Media::Video { .. } => "video",
            Media::Audio { .. } => "audio",
            Media::Other { kind } => kind,
        }
    }
}

/// A message received from the source platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    /// Message text, or the caption for media messages
    pub text: Option<String>,
    pub media: Option<Media>,
}

impl IncomingMessage {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// True for messages with neither media nor visible text.
    pub fn is_blank(&self) -> bool {
        self.media.is_none() && self.text().trim().is_empty()
    }
}

/// Downloads media payloads referenced by incoming messages.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>>;
}
