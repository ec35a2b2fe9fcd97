use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Webp,
    Unknown,
}

impl ImageKind {
    /// Classifies a payload by its leading magic bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes {
            [0x89, b'P', b'N', b'G', ..] => ImageKind::Png,
            [0xFF, 0xD8, 0xFF, ..] => ImageKind::Jpeg,
            [b'G', b'I', b'F', b'8', ..] => ImageKind::Gif,
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => ImageKind::Webp,
            [b'B', b'M', ..] => ImageKind::Bmp,
            _ => ImageKind::Unknown,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpg",
            ImageKind::Gif => "gif",
            ImageKind::Bmp => "bmp",
            ImageKind::Webp => "webp",
            ImageKind::Unknown => "bin",
        }
    }
}

pub fn decode(payload: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(payload.trim())?)
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
