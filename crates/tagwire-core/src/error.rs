use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagwireError {
    /// A write that turned out to be a no-op. Not a failure.
    #[error("value unchanged")]
    ValueUnchanged,

    #[error("value not settable")]
    ValueNotSettable,

    /// Returned by an event handler to pass the event to the next handler in the chain.
    #[error("event unhandled")]
    EventUnhandled,

    #[error("{type_name} is not comparable")]
    NotComparable { type_name: &'static str },

    #[error("illegal tag type {type_name}")]
    IllegalTagType { type_name: &'static str },

    #[error("too many tags")]
    TooManyTags,

    #[error("connection {key}: {queue} queue full sending {message}")]
    QueueOverflow {
        key: String,
        queue: &'static str,
        message: String,
    },

    #[error("no WebSocket request received from {}", display_ip(.remote_ip))]
    NoWebSocketRequest { remote_ip: Option<IpAddr> },

    #[error("connection {key} cancelled before it was claimed: {cause}")]
    PendingCancelled {
        key: String,
        #[source]
        cause: Box<TagwireError>,
    },

    #[error("{type_name} panic: {message}")]
    HandlerPanic {
        type_name: &'static str,
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    #[error("connection already claimed")]
    RequestAlreadyClaimed,

    #[error("connection {key}: expected IP {}, got {}", display_ip(.expected), display_ip(.actual))]
    RemoteIpMismatch {
        key: String,
        expected: Option<IpAddr>,
        actual: Option<IpAddr>,
    },

    #[error("websocket request missing Origin header")]
    OriginMissing,

    #[error("websocket Origin not http or https")]
    OriginWrongScheme,

    #[error("websocket Origin host mismatch")]
    OriginWrongHost,

    #[error("javascript is disabled")]
    JavascriptDisabled,

    #[error("replace: expected HTML {expected}")]
    ReplaceMissingId { expected: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TagwireError {
    pub fn is_event_unhandled(&self) -> bool {
        matches!(self, Self::EventUnhandled)
    }

    pub fn is_value_unchanged(&self) -> bool {
        matches!(self, Self::ValueUnchanged)
    }

    /// Short machine-readable label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValueUnchanged => "value_unchanged",
            Self::ValueNotSettable => "value_not_settable",
            Self::EventUnhandled => "event_unhandled",
            Self::NotComparable { .. } => "not_comparable",
            Self::IllegalTagType { .. } => "illegal_tag_type",
            Self::TooManyTags => "too_many_tags",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::NoWebSocketRequest { .. } => "no_websocket_request",
            Self::PendingCancelled { .. } => "pending_cancelled",
            Self::HandlerPanic { .. } => "handler_panic",
            Self::RequestAlreadyClaimed => "request_already_claimed",
            Self::RemoteIpMismatch { .. } => "remote_ip_mismatch",
            Self::OriginMissing => "origin_missing",
            Self::OriginWrongScheme => "origin_wrong_scheme",
            Self::OriginWrongHost => "origin_wrong_host",
            Self::JavascriptDisabled => "javascript_disabled",
            Self::ReplaceMissingId { .. } => "replace_missing_id",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

fn display_ip(ip: &Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_else(|| "invalid IP".into())
}

pub type Result<T> = std::result::Result<T, TagwireError>;
