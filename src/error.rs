//! Journaly error types

use thiserror::Error;

/// Journaly error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote document could not be decoded into a typed record
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The requested day selection is not allowed
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// Subscription setup or delivery failed
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Media blob could not be materialized locally
    #[error("Media download error: {0}")]
    MediaDownload(#[from] MediaDownloadError),

    /// Authentication error
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Remote store rejected or failed a request
    #[error("Remote store error: {0}")]
    Remote(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short, stable tag for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Decode(_) => "decode",
            Self::InvalidSelection(_) => "invalid_selection",
            Self::Subscription(_) => "subscription",
            Self::MediaDownload(_) => "media_download",
            Self::Auth(_) => "auth",
            Self::Remote(_) => "remote",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Http(_) => "http",
            Self::Internal(_) => "internal",
        }
    }
}

/// Structural problems found while decoding a remote document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("document {id}: missing required field `{field}`")]
    MissingField { id: String, field: &'static str },

    #[error("document {id}: invalid field `{field}`: {reason}")]
    InvalidField {
        id: String,
        field: &'static str,
        reason: String,
    },

    #[error("document {id}: unknown memory kind `{kind}`")]
    UnknownKind { id: String, kind: String },

    #[error("document {id}: memory kind `{kind}` is not supported")]
    UnsupportedKind { id: String, kind: String },

    #[error("document {id}: kind `{kind}` requires a populated `{field}` field")]
    MissingContent {
        id: String,
        kind: String,
        field: &'static str,
    },

    #[error("document {id}: kind `{kind}` must not carry a `{field}` field")]
    ConflictingContent {
        id: String,
        kind: String,
        field: &'static str,
    },

    #[error("document {id}: not a yyyy-MM-dd day key")]
    InvalidDayKey { id: String },
}

/// Failure to download or install a media blob.
///
/// Cloneable so a single in-flight download can report the same outcome to
/// every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{url}: {reason}")]
pub struct MediaDownloadError {
    pub url: String,
    pub reason: String,
}

impl MediaDownloadError {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Authentication failures surfaced to the caller of sign-in/up/out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("an account already exists for {0}")]
    AccountExists(String),

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("a sign-in is already active or in progress")]
    AlreadySignedIn,

    #[error("auth provider error: {0}")]
    Provider(String),
}

/// Result type alias for Journaly operations
pub type Result<T> = std::result::Result<T, Error>;
