//! Attachment normalization: classification, image encoding, upload handling.
//!
//! An [`Attachment`] always carries exactly one data source. Everything in
//! this module degrades instead of failing: unknown types classify as
//! [`AttachmentKind::Unknown`], undecodable image data becomes a text
//! placeholder, and persistence errors only drop the stored reference.

pub mod store;

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::ContentPart;

pub use store::{AttachmentStore, DirectoryStore};

/// Uploads larger than this are accepted but downgraded to `Unknown`.
pub const MAX_ATTACHMENT_BYTES: usize = 50 * 1024 * 1024;

/// Used when neither the payload nor the caller tells us the image format.
const FALLBACK_IMAGE_MIME: &str = "image/jpeg";

/// Characters of the offending input echoed back in the placeholder text.
const PLACEHOLDER_PREVIEW_CHARS: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment needs one of bytes, path or url")]
    NoSource,

    #[error("attachment not found: {0}")]
    NotFound(String),

    #[error("attachment reference outside the upload directories: {0}")]
    OutsideRoot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
    Unknown,
}

impl AttachmentKind {
    pub const ALL: [AttachmentKind; 5] = [
        AttachmentKind::Image,
        AttachmentKind::Audio,
        AttachmentKind::Video,
        AttachmentKind::Document,
        AttachmentKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
            AttachmentKind::Unknown => "unknown",
        }
    }

    /// Parse a caller-declared kind such as `"image"`. Anything else is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => AttachmentKind::Image,
            "audio" => AttachmentKind::Audio,
            "video" => AttachmentKind::Video,
            "document" => AttachmentKind::Document,
            _ => AttachmentKind::Unknown,
        }
    }
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the attachment's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    /// An http(s) URL, a `data:` URI, or raw base64 text.
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub source: AttachmentSource,
    pub media_type: String,
    pub original_filename: Option<String>,
    pub size_bytes: Option<u64>,
    /// Reference returned by an [`AttachmentStore`] when the bytes were persisted.
    pub stored_url: Option<String>,
}

impl Attachment {
    pub fn builder() -> AttachmentBuilder {
        AttachmentBuilder::default()
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }

    /// Loggable description of the attachment. Never includes the payload.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("kind".into(), Value::String(self.kind.to_string()));
        meta.insert("media_type".into(), Value::String(self.media_type.clone()));
        if let Some(name) = &self.original_filename {
            meta.insert("filename".into(), Value::String(name.clone()));
        }
        if let Some(size) = self.size_bytes {
            meta.insert("size".into(), Value::from(size));
        }
        if let Some(url) = self.reference_url() {
            meta.insert("url".into(), Value::String(url));
        }
        meta
    }

    /// The best URL-ish reference for this attachment, if it has one that is
    /// not inline data.
    pub fn reference_url(&self) -> Option<String> {
        if let Some(url) = &self.stored_url {
            return Some(url.clone());
        }
        match &self.source {
            AttachmentSource::Url(u) if is_remote_url(u) => Some(u.clone()),
            AttachmentSource::Path(p) => Some(p.display().to_string()),
            _ => None,
        }
    }
}

/// Collects candidate sources and metadata, then settles on one source.
#[derive(Debug, Default, Clone)]
pub struct AttachmentBuilder {
    bytes: Option<Vec<u8>>,
    path: Option<PathBuf>,
    url: Option<String>,
    kind: Option<AttachmentKind>,
    media_type: Option<String>,
    filename: Option<String>,
    size_bytes: Option<u64>,
    stored_url: Option<String>,
}

impl AttachmentBuilder {
    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bytes = Some(bytes.into());
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Force a kind instead of classifying from media type and filename.
    pub fn kind(mut self, kind: AttachmentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn size_bytes(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn stored_url(mut self, url: impl Into<String>) -> Self {
        self.stored_url = Some(url.into());
        self
    }

    /// Settle on a single source: bytes, then path, then url.
    ///
    /// Zero sources is an error. Several sources are tolerated with a warning.
    pub fn build(self) -> Result<Attachment, AttachmentError> {
        let populated = [self.bytes.is_some(), self.path.is_some(), self.url.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
        if populated > 1 {
            warn!(
                populated,
                "attachment has several sources; using bytes, then path, then url"
            );
        }

        let source = if let Some(b) = self.bytes {
            AttachmentSource::Bytes(b)
        } else if let Some(p) = self.path {
            AttachmentSource::Path(p)
        } else if let Some(u) = self.url {
            AttachmentSource::Url(u)
        } else {
            return Err(AttachmentError::NoSource);
        };

        let media_type = self
            .media_type
            .filter(|m| !m.trim().is_empty())
            .or_else(|| match &source {
                AttachmentSource::Url(u) => data_uri_mime(u).map(str::to_string),
                _ => None,
            })
            .unwrap_or_default();
        let filename = self.filename.or_else(|| match &source {
            AttachmentSource::Path(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()),
            AttachmentSource::Url(u) => url_filename(u),
            _ => None,
        });
        let kind = self
            .kind
            .unwrap_or_else(|| classify(&media_type, filename.as_deref()));
        let size_bytes = self.size_bytes.or(match &source {
            AttachmentSource::Bytes(b) => Some(b.len() as u64),
            _ => None,
        });

        Ok(Attachment {
            kind,
            source,
            media_type,
            original_filename: filename,
            size_bytes,
            stored_url: self.stored_url,
        })
    }
}

/// Classify by media type, then by file extension. Never fails.
pub fn classify(media_type: &str, filename: Option<&str>) -> AttachmentKind {
    let kind = kind_for_media_type(media_type);
    if kind != AttachmentKind::Unknown {
        return kind;
    }
    filename
        .map(kind_for_extension)
        .unwrap_or(AttachmentKind::Unknown)
}

fn kind_for_media_type(media_type: &str) -> AttachmentKind {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" | "image/jpeg" | "image/jpg" | "image/webp" | "image/gif" => {
            AttachmentKind::Image
        }
        "video/mp4" | "video/webm" | "video/quicktime" | "video/x-flv" | "video/mpeg"
        | "video/wmv" | "video/3gpp" => AttachmentKind::Video,
        "audio/wav" | "audio/mp3" | "audio/mpeg" | "audio/m4a" | "audio/flac" | "audio/ogg" => {
            AttachmentKind::Audio
        }
        "application/pdf"
        | "text/plain"
        | "text/csv"
        | "application/json"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            AttachmentKind::Document
        }
        _ => AttachmentKind::Unknown,
    }
}

fn kind_for_extension(filename: &str) -> AttachmentKind {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" => AttachmentKind::Image,
        "mp4" | "mov" | "avi" | "mkv" | "webm" => AttachmentKind::Video,
        "wav" | "mp3" | "m4a" | "flac" | "ogg" => AttachmentKind::Audio,
        "pdf" | "txt" | "csv" | "json" | "docx" => AttachmentKind::Document,
        _ => AttachmentKind::Unknown,
    }
}

/// Sniff an image format from its leading bytes.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Render an attachment as an image content part.
///
/// URLs and `data:` URIs pass through unchanged. Everything else is encoded
/// as a `data:{mime};base64,...` URI. Data that cannot be decoded or read
/// becomes a text part so the turn can still go ahead.
pub fn image_part(attachment: &Attachment) -> ContentPart {
    let declared = declared_image_mime(&attachment.media_type);
    match &attachment.source {
        AttachmentSource::Url(reference) => {
            let reference = reference.trim();
            if is_remote_url(reference) || reference.starts_with("data:") {
                return ContentPart::image(reference);
            }
            let compact: String = reference.chars().filter(|c| !c.is_whitespace()).collect();
            match BASE64.decode(compact.as_bytes()) {
                Ok(decoded) if !decoded.is_empty() => {
                    let mime = sniff_image_mime(&decoded)
                        .or(declared)
                        .unwrap_or(FALLBACK_IMAGE_MIME);
                    ContentPart::image(format!("data:{mime};base64,{compact}"))
                }
                _ => {
                    debug!("image payload is not valid base64");
                    unprocessable(reference)
                }
            }
        }
        AttachmentSource::Bytes(bytes) => {
            let mime = sniff_image_mime(bytes)
                .or(declared)
                .unwrap_or(FALLBACK_IMAGE_MIME);
            ContentPart::image(encode_data_uri(mime, bytes))
        }
        AttachmentSource::Path(path) => match std::fs::read(path) {
            Ok(bytes) => {
                let guessed = mime_guess::from_path(path)
                    .iter()
                    .find(|m| m.type_() == mime_guess::mime::IMAGE)
                    .map(|m| m.essence_str().to_string());
                let mime = sniff_image_mime(&bytes)
                    .map(str::to_string)
                    .or(guessed)
                    .or(declared.map(str::to_string))
                    .unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string());
                ContentPart::image(encode_data_uri(&mime, &bytes))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read image file");
                unprocessable(&path.display().to_string())
            }
        },
    }
}

/// Classify, size-check and optionally persist an uploaded file.
///
/// Oversized payloads are kept but marked `Unknown`. A failing store only
/// leaves `stored_url` empty.
pub fn normalize_upload(
    bytes: Vec<u8>,
    filename: &str,
    media_type: &str,
    store: Option<&dyn AttachmentStore>,
) -> Attachment {
    let mut kind = classify(media_type, Some(filename));
    if bytes.len() > MAX_ATTACHMENT_BYTES {
        warn!(
            filename,
            size = bytes.len(),
            limit = MAX_ATTACHMENT_BYTES,
            "attachment exceeds size limit; treating as unknown"
        );
        kind = AttachmentKind::Unknown;
    }

    let stored_url = store.and_then(|s| match s.put(kind, filename, &bytes) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(filename, error = %e, "failed to persist attachment");
            None
        }
    });

    let size = bytes.len() as u64;
    Attachment {
        kind,
        source: AttachmentSource::Bytes(bytes),
        media_type: media_type.to_string(),
        original_filename: Some(filename.to_string()),
        size_bytes: Some(size),
        stored_url,
    }
}

fn is_remote_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Last non-empty path segment of an http(s) URL, without query or fragment.
fn url_filename(url: &str) -> Option<String> {
    let url = url.trim();
    if !is_remote_url(url) {
        return None;
    }
    let after_scheme = url.split_once("://").map(|(_, rest)| rest)?;
    let path = after_scheme.split(['?', '#']).next().unwrap_or("");
    let (_, path) = path.split_once('/')?;
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Media type of a `data:{mime};base64,...` URI.
fn data_uri_mime(uri: &str) -> Option<&str> {
    let rest = uri.trim().strip_prefix("data:")?;
    let (header, _) = rest.split_once(',')?;
    let mime = header.split(';').next().unwrap_or("").trim();
    (!mime.is_empty()).then_some(mime)
}

fn declared_image_mime(media_type: &str) -> Option<&str> {
    let essence = media_type.split(';').next().unwrap_or("").trim();
    essence.starts_with("image/").then_some(essence)
}

fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

fn unprocessable(input: &str) -> ContentPart {
    let preview: String = input.chars().take(PLACEHOLDER_PREVIEW_CHARS).collect();
    ContentPart::text(format!("[Image data could not be processed: {preview}...]"))
}
