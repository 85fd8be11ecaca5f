//! Media Encoder: turns captured photos and videos into storable payloads
//! with an optional small preview.
//!
//! Photos are kept inline as base64 data URIs; videos stay as raw files in the
//! blob directory. Previews are best effort and never block a save.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{MediaKind, MediaPayload};

/// Longest edge of a generated preview, in pixels
pub const THUMBNAIL_MAX_EDGE: u32 = 200;
pub const THUMBNAIL_JPEG_QUALITY: u8 = 70;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("blob IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not extract a still frame: {0}")]
    Frame(String),

    #[error("empty media payload")]
    Empty,
}

/// Pulls one representative still out of a video file.
///
/// Implementations are allowed to fail; callers treat a failure as "no preview".
pub trait FrameGrabber: Send + Sync {
    fn grab_frame(&self, video: &Path) -> Result<DynamicImage, MediaError>;
}

/// Result of encoding one captured file
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMedia {
    pub kind: MediaKind,
    pub mime_type: String,
    pub payload: MediaPayload,
    pub thumbnail: Option<String>,
}

pub fn to_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, base64::encode(bytes))
}

/// Base64 body of a data URI; plain base64 is passed through.
pub fn strip_data_uri_prefix(data: &str) -> &str {
    match data.split_once(',') {
        Some((_, body)) => body,
        None => data,
    }
}

pub fn decode_data_uri(data: &str) -> Result<Vec<u8>, MediaError> {
    let bytes = base64::decode(strip_data_uri_prefix(data).trim())?;
    if bytes.is_empty() {
        return Err(MediaError::Empty);
    }
    Ok(bytes)
}

/// Downscales to fit THUMBNAIL_MAX_EDGE and re-encodes as a JPEG data URI.
pub fn thumbnail_from_image(image: &DynamicImage) -> Result<String, MediaError> {
    let preview = image.thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE).to_rgb8();
    let mut jpeg = Vec::new();
    preview.write_with_encoder(JpegEncoder::new_with_quality(
        &mut jpeg,
        THUMBNAIL_JPEG_QUALITY,
    ))?;
    Ok(to_data_uri("image/jpeg", &jpeg))
}

pub fn thumbnail_from_bytes(bytes: &[u8]) -> Result<String, MediaError> {
    let image = image::load_from_memory(bytes)?;
    thumbnail_from_image(&image)
}

/// Inline-encodes a photo. A preview that cannot be produced is logged and left out.
pub fn encode_photo(bytes: &[u8], mime_type: &str) -> Result<EncodedMedia, MediaError> {
    if bytes.is_empty() {
        return Err(MediaError::Empty);
    }

    let thumbnail = match thumbnail_from_bytes(bytes) {
        Ok(thumbnail) => Some(thumbnail),
        Err(e) => {
            tracing::warn!("Photo thumbnail failed, saving without preview: {}", e);
            None
        }
    };

    Ok(EncodedMedia {
        kind: MediaKind::Photo,
        mime_type: mime_type.to_string(),
        payload: MediaPayload::Inline {
            data_uri: to_data_uri(mime_type, bytes),
        },
        thumbnail,
    })
}

/// Wraps an already stored video file. Frame extraction is attempted only when a grabber is given.
pub fn encode_video(
    blob_path: PathBuf,
    mime_type: &str,
    grabber: Option<&dyn FrameGrabber>,
) -> EncodedMedia {
    let thumbnail = grabber.and_then(|grabber| {
        match grabber
            .grab_frame(&blob_path)
            .and_then(|frame| thumbnail_from_image(&frame))
        {
            Ok(thumbnail) => Some(thumbnail),
            Err(e) => {
                tracing::warn!(
                    "Video preview failed for {}, saving without preview: {}",
                    blob_path.display(),
                    e
                );
                None
            }
        }
    });

    EncodedMedia {
        kind: MediaKind::Video,
        mime_type: mime_type.to_string(),
        payload: MediaPayload::Blob {
            path: blob_path.to_string_lossy().to_string(),
        },
        thumbnail,
    }
}

/// Bytes ready for upload, whichever way the payload is stored.
pub fn materialize_payload(payload: &MediaPayload) -> Result<Vec<u8>, MediaError> {
    match payload {
        MediaPayload::Inline { data_uri } => decode_data_uri(data_uri),
        MediaPayload::Blob { path } => {
            let bytes = std::fs::read(path)?;
            if bytes.is_empty() {
                return Err(MediaError::Empty);
            }
            Ok(bytes)
        }
    }
}

/// `{date}_{system}_{kind}_{suffix}.{ext}` with the system id reduced to `[A-Za-z0-9-]`
/// and a base-36 millisecond suffix.
pub fn media_filename(date: &str, system_id: &str, kind: MediaKind, at: DateTime<Utc>) -> String {
    let safe_system: String = system_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!(
        "{}_{}_{}_{}.{}",
        date,
        safe_system,
        kind.as_str(),
        to_base36(at.timestamp_millis().max(0) as u64),
        kind.extension()
    )
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
