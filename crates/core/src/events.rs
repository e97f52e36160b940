use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle and data events reported by a transport connection.
///
/// A connection emits at most one `Opened`, any number of `Message`s and at
/// most one terminal `Error` or `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(String),
    Closed { reason: Option<String> },
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Error(_) | TransportEvent::Closed { .. })
    }
}

// ---------------------------------------------------------------------------
// Status messages
// ---------------------------------------------------------------------------

/// How a status message should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Hex color the web view uses for the message text.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Success => "#10B981",
            Severity::Warning | Severity::Error => "#EF4444",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Severity::Success => "✅",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
        }
    }
}

/// A user-facing status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub severity: Severity,
    pub color: String,
    pub shown_at: DateTime<Utc>,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            severity,
            color: severity.color().to_string(),
            shown_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.severity.icon(), self.text)
    }
}
