//! Entities persisted through the repositories.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A type stored as a [`super::PersistedRecord`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Record kind; also the cache key namespace.
    const KIND: &'static str;

    /// Key unique within [`Entity::KIND`].
    fn key(&self) -> String;
}

/// Account profile of a user of the verification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Stable user identifier.
    pub user_id: String,
    /// Contact email.
    pub email: String,
    /// Display handle.
    pub username: String,
    /// Whether the account may submit content.
    pub is_active: bool,
    /// Free-form user preferences.
    #[serde(default)]
    pub preferences: serde_json::Value,
}

impl Entity for UserProfile {
    const KIND: &'static str = "profile";

    fn key(&self) -> String {
        self.user_id.clone()
    }
}

/// Lifecycle state of a verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Analysis finished and produced a score.
    Completed,
    /// Analysis failed (timeout, crash, bad input).
    Failed,
}

/// Outcome of one content verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// Content identifier (derived from the content hash or caller supplied).
    pub content_id: String,
    /// Submitting user.
    pub user_id: String,
    /// MIME type of the analyzed content.
    pub content_type: String,
    /// Size of the analyzed payload in bytes.
    pub content_size: usize,
    /// Authenticity score in `0.0..=1.0`.
    pub score: f64,
    /// Confidence of the score in `0.0..=1.0`.
    pub confidence: f64,
    /// Human-readable assessment label.
    pub assessment: String,
    /// Individual findings reported by the analyzer.
    pub findings: Vec<String>,
    /// Request status.
    pub status: VerificationStatus,
    /// Analysis task correlation id.
    pub task_id: Uuid,
    /// When the analysis finished.
    pub analyzed_at: DateTime<Utc>,
}

impl Entity for VerificationRecord {
    const KIND: &'static str = "verification";

    fn key(&self) -> String {
        self.content_id.clone()
    }
}
