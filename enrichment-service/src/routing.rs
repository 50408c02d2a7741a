//! Modality routing.
//!
//! Maps a filename and an optional declared content type to the pipeline
//! modality that should handle it. Classification is pure: no I/O and no
//! failure mode, so the same inputs always produce the same route.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Content modality of a document
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    Unknown,
}

impl Modality {
    /// Modality whose extractor handles this content. Unknown content is read as text.
    pub fn extraction_modality(self) -> Modality {
        match self {
            Modality::Unknown => Modality::Text,
            other => other,
        }
    }
}

/// Why a document was routed to its modality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Extension(Modality),
    ContentType(Modality),
    Fallback,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::Extension(modality) => write!(f, "extension:{}", modality),
            RouteReason::ContentType(modality) => write!(f, "content-type:{}", modality),
            RouteReason::Fallback => write!(f, "fallback:{}", Modality::Unknown),
        }
    }
}

/// Result of classifying a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub modality: Modality,
    pub reason: RouteReason,
}

const TEXT_EXTENSIONS: &[&str] = &["pdf", "docx", "txt"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "ogg", "flac"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm"];

const TEXT_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

/// Classify a document by extension first, then by declared content type.
pub fn classify(filename: &str, content_type: Option<&str>) -> Route {
    if let Some(modality) = modality_for_extension(filename) {
        return Route {
            modality,
            reason: RouteReason::Extension(modality),
        };
    }

    if let Some(modality) = content_type.and_then(modality_for_content_type) {
        return Route {
            modality,
            reason: RouteReason::ContentType(modality),
        };
    }

    Route {
        modality: Modality::Unknown,
        reason: RouteReason::Fallback,
    }
}

/// Whether the filename carries one of the routable extensions
pub fn is_known_extension(filename: &str) -> bool {
    modality_for_extension(filename).is_some()
}

fn modality_for_extension(filename: &str) -> Option<Modality> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();

    if TEXT_EXTENSIONS.contains(&ext) {
        Some(Modality::Text)
    } else if IMAGE_EXTENSIONS.contains(&ext) {
        Some(Modality::Image)
    } else if AUDIO_EXTENSIONS.contains(&ext) {
        Some(Modality::Audio)
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        Some(Modality::Video)
    } else {
        None
    }
}

fn modality_for_content_type(content_type: &str) -> Option<Modality> {
    let lowered = content_type.trim().to_ascii_lowercase();
    // Parameters (`; charset=...`) never affect routing
    let essence = lowered.split(';').next().unwrap_or_default().trim();
    let (top_level, _) = essence.split_once('/')?;

    if top_level == mime::IMAGE.as_str() {
        Some(Modality::Image)
    } else if top_level == mime::AUDIO.as_str() {
        Some(Modality::Audio)
    } else if top_level == mime::VIDEO.as_str() {
        Some(Modality::Video)
    } else if TEXT_CONTENT_TYPES.contains(&essence) {
        Some(Modality::Text)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_tables() {
        let cases = [
            (TEXT_EXTENSIONS, Modality::Text),
            (IMAGE_EXTENSIONS, Modality::Image),
            (AUDIO_EXTENSIONS, Modality::Audio),
            (VIDEO_EXTENSIONS, Modality::Video),
        ];

        for (extensions, expected) in cases {
            for ext in extensions {
                let route = classify(&format!("file.{}", ext), None);
                assert_eq!(route.modality, expected, "extension {}", ext);
                assert_eq!(route.reason.to_string(), format!("extension:{}", expected));
            }
        }
    }

    #[test]
    fn test_extension_is_case_insensitive_and_beats_content_type() {
        let route = classify("Scan.JPEG", Some("application/pdf"));
        assert_eq!(route.modality, Modality::Image);
        assert_eq!(route.reason, RouteReason::Extension(Modality::Image));
    }

    #[test]
    fn test_content_type_fallback() {
        let route = classify("upload", Some("Audio/MPEG"));
        assert_eq!(route.modality, Modality::Audio);
        assert_eq!(route.reason.to_string(), "content-type:audio");

        let route = classify("notes.md", Some("text/plain; charset=utf-8"));
        assert_eq!(route.modality, Modality::Text);

        let route = classify(
            "report",
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        );
        assert_eq!(route.modality, Modality::Text);
    }

    #[test]
    fn test_content_type_prefix_ignores_malformed_subtype() {
        let route = classify("upload", Some("image/jpeg garbage"));
        assert_eq!(route.modality, Modality::Image);
        assert_eq!(route.reason, RouteReason::ContentType(Modality::Image));

        assert_eq!(classify("upload", Some("audio/x weird")).modality, Modality::Audio);
        assert_eq!(classify("upload", Some(" VIDEO/")).modality, Modality::Video);
    }

    #[test]
    fn test_unknown_fallback() {
        for (filename, content_type) in [
            ("archive.tar.gz", None),
            ("archive.zip", Some("application/zip")),
            ("noextension", Some("not a mime type")),
            ("page.html", Some("text/html")),
        ] {
            let route = classify(filename, content_type);
            assert_eq!(route.modality, Modality::Unknown, "{}", filename);
            assert_eq!(route.reason.to_string(), "fallback:unknown");
        }
    }

    #[test]
    fn test_classify_is_deterministic() {
        let first = classify("clip.webm", Some("video/webm"));
        for _ in 0..10 {
            assert_eq!(classify("clip.webm", Some("video/webm")), first);
        }
    }

    #[test]
    fn test_unknown_extracts_as_text() {
        assert_eq!(Modality::Unknown.extraction_modality(), Modality::Text);
        assert_eq!(Modality::Video.extraction_modality(), Modality::Video);
    }
}
