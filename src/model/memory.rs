//! Memory records: single journal entries scoped to a day
//!
//! Each memory carries exactly one content field, selected by its kind:
//!
//! | kind     | field    | shape          |
//! |----------|----------|----------------|
//! | `text`   | `text`   | string         |
//! | `images` | `images` | list of URLs   |
//! | `gif`    | `gif`    | URL            |
//! | `audio`  | `audio`  | URL            |
//!
//! `video` is a recognised kind with no content field; such documents are
//! rejected as unsupported.

use super::document::{Keyed, RawDocument};
use crate::cache::MediaKind;
use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Memory content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Text,
    Images,
    Gif,
    Audio,
    Video,
}

impl MemoryKind {
    /// Name of the document field holding this kind's content
    pub fn content_field(&self) -> Option<&'static str> {
        match self {
            Self::Text => Some("text"),
            Self::Images => Some("images"),
            Self::Gif => Some("gif"),
            Self::Audio => Some("audio"),
            Self::Video => None,
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Images => write!(f, "images"),
            Self::Gif => write!(f, "gif"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "images" => Ok(Self::Images),
            "gif" => Ok(Self::Gif),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown memory kind: {}", other)),
        }
    }
}

/// Geographic position where a memory was recorded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// The single populated content field of a memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryContent {
    Text(String),
    Images(Vec<String>),
    Gif(String),
    Audio(String),
}

impl MemoryContent {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::Text(_) => MemoryKind::Text,
            Self::Images(_) => MemoryKind::Images,
            Self::Gif(_) => MemoryKind::Gif,
            Self::Audio(_) => MemoryKind::Audio,
        }
    }

    /// Remote media this content references that belongs in the local cache.
    /// GIFs are rendered straight from their URL and are not cached.
    pub fn cacheable_media(&self) -> Vec<(&str, MediaKind)> {
        match self {
            Self::Images(urls) => urls
                .iter()
                .map(|u| (u.as_str(), MediaKind::Image))
                .collect(),
            Self::Audio(url) => vec![(url.as_str(), MediaKind::Audio)],
            Self::Text(_) | Self::Gif(_) => Vec::new(),
        }
    }
}

/// A decoded memory document
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub location: Option<GeoPoint>,
    pub content: MemoryContent,
}

/// Wire shape of a memory's field map
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryFields {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(alias = "createdAt", skip_serializing_if = "Option::is_none")]
    datetime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gif: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<String>,
}

impl MemoryFields {
    fn from_parts(
        created_at: DateTime<Utc>,
        title: &str,
        location: Option<GeoPoint>,
        content: &MemoryContent,
    ) -> Self {
        let mut fields = Self {
            kind: Some(content.kind().to_string()),
            datetime: Some(created_at),
            title: Some(title.to_string()),
            location,
            ..Default::default()
        };
        match content {
            MemoryContent::Text(text) => fields.text = Some(text.clone()),
            MemoryContent::Images(urls) => fields.images = Some(urls.clone()),
            MemoryContent::Gif(url) => fields.gif = Some(url.clone()),
            MemoryContent::Audio(url) => fields.audio = Some(url.clone()),
        }
        fields
    }

    /// Content fields that carry a non-empty value, in declaration order
    fn populated(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.text.as_deref().is_some_and(|s| !s.is_empty()) {
            fields.push("text");
        }
        if self.images.as_ref().is_some_and(|v| !v.is_empty()) {
            fields.push("images");
        }
        if self.gif.as_deref().is_some_and(|s| !s.is_empty()) {
            fields.push("gif");
        }
        if self.audio.as_deref().is_some_and(|s| !s.is_empty()) {
            fields.push("audio");
        }
        fields
    }

    fn into_map(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl MemoryRecord {
    pub fn kind(&self) -> MemoryKind {
        self.content.kind()
    }

    /// Validate a memory document into a typed record.
    ///
    /// Fails when `type` or `datetime` is missing, when the kind is not
    /// recognised, or when the populated content fields do not match the kind.
    pub fn decode(doc: &RawDocument) -> Result<Self, DecodeError> {
        let id = doc.id.clone();
        let fields: MemoryFields = serde_json::from_value(Value::Object(doc.data.clone()))
            .map_err(|e| DecodeError::InvalidField {
                id: id.clone(),
                field: "fields",
                reason: e.to_string(),
            })?;

        let raw_kind = fields.kind.clone().ok_or_else(|| DecodeError::MissingField {
            id: id.clone(),
            field: "type",
        })?;
        let kind: MemoryKind = raw_kind.parse().map_err(|_| DecodeError::UnknownKind {
            id: id.clone(),
            kind: raw_kind.clone(),
        })?;
        let created_at = fields.datetime.ok_or_else(|| DecodeError::MissingField {
            id: id.clone(),
            field: "datetime",
        })?;

        let Some(expected) = kind.content_field() else {
            return Err(DecodeError::UnsupportedKind {
                id,
                kind: raw_kind,
            });
        };

        let populated = fields.populated();
        if !populated.contains(&expected) {
            return Err(DecodeError::MissingContent {
                id,
                kind: raw_kind,
                field: expected,
            });
        }
        if let Some(extra) = populated.into_iter().find(|f| *f != expected) {
            return Err(DecodeError::ConflictingContent {
                id,
                kind: raw_kind,
                field: extra,
            });
        }

        let content = match kind {
            MemoryKind::Text => MemoryContent::Text(fields.text.unwrap_or_default()),
            MemoryKind::Images => MemoryContent::Images(fields.images.unwrap_or_default()),
            MemoryKind::Gif => MemoryContent::Gif(fields.gif.unwrap_or_default()),
            MemoryKind::Audio => MemoryContent::Audio(fields.audio.unwrap_or_default()),
            MemoryKind::Video => {
                return Err(DecodeError::UnsupportedKind {
                    id,
                    kind: raw_kind,
                })
            }
        };

        Ok(Self {
            id,
            created_at,
            title: fields.title.unwrap_or_default(),
            location: fields.location,
            content,
        })
    }

    /// Encode back into the document shape accepted by `decode`
    pub fn to_document(&self) -> RawDocument {
        let fields =
            MemoryFields::from_parts(self.created_at, &self.title, self.location, &self.content);
        RawDocument::new(self.id.clone(), fields.into_map())
    }
}

impl Keyed for MemoryRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A memory that has not been stored yet (no identifier)
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryDraft {
    pub title: String,
    pub content: MemoryContent,
    pub location: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
}

impl MemoryDraft {
    pub fn new(title: impl Into<String>, content: MemoryContent) -> Self {
        Self {
            title: title.into(),
            content,
            location: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Field map to send to the remote store
    pub fn to_fields(&self) -> Map<String, Value> {
        MemoryFields::from_parts(self.created_at, &self.title, self.location, &self.content)
            .into_map()
    }

    /// Attach a server-assigned identifier
    pub fn into_record(self, id: impl Into<String>) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            created_at: self.created_at,
            title: self.title,
            location: self.location,
            content: self.content,
        }
    }
}
