use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, FileMeta};
use tracing::{debug, error, info, warn};

use crate::config::TelegramConfig;
use crate::platform::{DocumentAttribute, IncomingMessage, Media, MediaSource, RemoteFile};
use crate::replicator::Replicator;

/// Build the bot client, pointing it at a custom Bot API server when configured.
pub fn build_bot(config: &TelegramConfig) -> Bot {
    let bot = Bot::new(config.bot_token.clone());
    match config.api_url.as_deref() {
        Some(url_str) => match reqwest::Url::parse(url_str) {
            Ok(url) => {
                info!(url = %url_str, "Using custom Telegram Bot API server");
                bot.set_api_url(url)
            }
            Err(e) => {
                error!(error = %e, url = %url_str, "Invalid telegram.api_url, using default");
                bot
            }
        },
        None => bot,
    }
}

/// Downloads message media through the Bot API.
pub struct TelegramMediaSource {
    bot: Bot,
}

impl TelegramMediaSource {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MediaSource for TelegramMediaSource {
    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>> {
        let meta = self
            .bot
            .get_file(FileId(file.id.clone()))
            .await
            .with_context(|| format!("getFile failed for {}", file.id))?;

        let mut buf = Vec::with_capacity(file.size as usize);
        self.bot
            .download_file(&meta.path, &mut buf)
            .await
            .with_context(|| format!("Failed to download {}", meta.path))?;

        debug!(file_id = %file.id, bytes = buf.len(), "Downloaded Telegram file");
        Ok(buf)
    }
}

fn remote(meta: &FileMeta) -> RemoteFile {
    RemoteFile::new(meta.id.0.clone(), u64::from(meta.size))
}

fn mime_string<M: ToString>(mime: Option<&M>) -> Option<String> {
    mime.map(ToString::to_string)
}

/// Convert a Telegram message into the platform-neutral form. Media kind is
/// decided here, once.
pub fn incoming_from(msg: &Message) -> IncomingMessage {
    let text = msg.text().or_else(|| msg.caption()).map(str::to_string);
    IncomingMessage {
        chat_id: msg.chat.id.0,
        text,
        media: media_of(msg),
    }
}

fn media_of(msg: &Message) -> Option<Media> {
    if let Some(photos) = msg.photo() {
        // sizes are ordered smallest first
        return photos.last().map(|p| Media::Photo {
            file: remote(&p.file),
        });
    }
    if let Some(doc) = msg.document() {
        return Some(Media::Document {
            file: remote(&doc.file),
            mime: mime_string(doc.mime_type.as_ref()),
            filename: doc.file_name.clone(),
            attributes: Vec::new(),
        });
    }
    if let Some(anim) = msg.animation() {
        return Some(Media::Document {
            file: remote(&anim.file),
            mime: mime_string(anim.mime_type.as_ref()),
            filename: anim.file_name.clone(),
            attributes: vec![DocumentAttribute::Animated, DocumentAttribute::Video],
        });
    }
    if let Some(video) = msg.video() {
        return Some(Media::Video {
            file: remote(&video.file),
            mime: mime_string(video.mime_type.as_ref()),
            filename: video.file_name.clone(),
        });
    }
    if let Some(note) = msg.video_note() {
        return Some(Media::Video {
            file: remote(&note.file),
            mime: Some("video/mp4".to_string()),
            filename: None,
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(Media::Audio {
            file: remote(&audio.file),
            mime: mime_string(audio.mime_type.as_ref()),
            filename: audio.file_name.clone(),
        });
    }
    // Voice notes are unnamed documents tagged as audio, so they still route
    // to the audio handler when Telegram omits the MIME type.
    if let Some(voice) = msg.voice() {
        return Some(Media::Document {
            file: remote(&voice.file),
            mime: mime_string(voice.mime_type.as_ref()),
            filename: None,
            attributes: vec![DocumentAttribute::Audio],
        });
    }

    let kind = if msg.sticker().is_some() {
        "sticker"
    } else if msg.location().is_some() {
        "location"
    } else if msg.contact().is_some() {
        "contact"
    } else if msg.poll().is_some() {
        "poll"
    } else if msg.dice().is_some() {
        "dice"
    } else if msg.venue().is_some() {
        "venue"
    } else {
        return None;
    };
    Some(Media::Other {
        kind: kind.to_string(),
    })
}

/// Listen for group messages and channel posts until Ctrl-C.
pub async fn run(bot: Bot, replicator: Arc<Replicator>) -> Result<()> {
    info!("Starting Telegram listener...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_channel_post().endpoint(handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![replicator])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Telegram listener stopped");
    Ok(())
}

async fn handle_message(msg: Message, replicator: Arc<Replicator>) -> ResponseResult<()> {
    let incoming = incoming_from(&msg);
    let chat_id = incoming.chat_id;
    if replicator.dispatch(incoming).is_some() {
        debug!(chat_id, message_id = msg.id.0, "Message queued for replication");
    } else {
        // Unrouted chats are expected noise in shared bots
        debug!(chat_id, "Ignoring message from unrouted chat");
    }
    Ok(())
}

/// Check the token and connectivity. Failure leaves the process running in
/// degraded mode so status endpoints stay up.
pub async fn verify(bot: &Bot) -> bool {
    match bot.get_me().await {
        Ok(me) => {
            info!(username = ?me.username, "Connected to Telegram");
            true
        }
        Err(e) => {
            warn!(error = %e, "Telegram connection check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{classify_media, Route};
    use serde_json::json;

    fn message(extra: serde_json::Value) -> Message {
        let mut base = json!({
            "message_id": 7,
            "date": 1706529600,
            "chat": {"id": 123, "type": "private"},
            "from": {"id": 123, "is_bot": false, "first_name": "Ana"}
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn test_text_message() {
        let msg = message(json!({"text": "hello"}));
        let incoming = incoming_from(&msg);
        assert_eq!(incoming.chat_id, 123);
        assert_eq!(incoming.text.as_deref(), Some("hello"));
        assert!(incoming.media.is_none());
    }

    #[test]
    fn test_photo_uses_largest_size() {
        let msg = message(json!({
            "caption": "sunset",
            "photo": [
                {"file_id": "small", "file_unique_id": "u1", "width": 90, "height": 60, "file_size": 1000},
                {"file_id": "large", "file_unique_id": "u2", "width": 1280, "height": 853, "file_size": 90000}
            ]
        }));
        let incoming = incoming_from(&msg);
        assert_eq!(incoming.text.as_deref(), Some("sunset"));
        assert_eq!(
            incoming.media,
            Some(Media::Photo {
                file: RemoteFile::new("large", 90000)
            })
        );
    }

    #[test]
    fn test_document_keeps_mime_and_name() {
        let msg = message(json!({
            "document": {
                "file_id": "doc1",
                "file_unique_id": "ud",
                "file_name": "report.pdf",
                "mime_type": "application/pdf",
                "file_size": 2048
            }
        }));
        match incoming_from(&msg).media {
            Some(Media::Document {
                file,
                mime,
                filename,
                attributes,
            }) => {
                assert_eq!(file, RemoteFile::new("doc1", 2048));
                assert_eq!(mime.as_deref(), Some("application/pdf"));
                assert_eq!(filename.as_deref(), Some("report.pdf"));
                assert!(attributes.is_empty());
            }
            other => panic!("unexpected media {:?}", other),
        }
    }

    #[test]
    fn test_voice_is_audio_document() {
        let msg = message(json!({
            "voice": {
                "file_id": "v1",
                "file_unique_id": "uv",
                "duration": 3,
                "file_size": 4000
            }
        }));
        let media = incoming_from(&msg).media.unwrap();
        match &media {
            Media::Document {
                mime,
                filename,
                attributes,
                ..
            } => {
                assert!(mime.is_none());
                assert!(filename.is_none());
                assert_eq!(attributes, &vec![DocumentAttribute::Audio]);
            }
            other => panic!("unexpected media {:?}", other),
        }
        assert_eq!(classify_media(&media), Route::Audio);
    }

    #[test]
    fn test_location_is_other_media() {
        let msg = message(json!({
            "location": {"latitude": 40.4, "longitude": -3.7}
        }));
        assert_eq!(
            incoming_from(&msg).media,
            Some(Media::Other {
                kind: "location".to_string()
            })
        );
    }
}
