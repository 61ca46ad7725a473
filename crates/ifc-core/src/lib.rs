//! Core domain model for the engagement collector.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ifc-core";

/// Logical source an item was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    TimelineReply,
    ThreadReply,
    KeywordMention,
}

impl SourceKind {
    /// Orchestration order. Earlier kinds win when the same post surfaces twice in one run.
    pub const ALL: [SourceKind; 3] = [
        SourceKind::TimelineReply,
        SourceKind::ThreadReply,
        SourceKind::KeywordMention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::TimelineReply => "timeline_reply",
            SourceKind::ThreadReply => "thread_reply",
            SourceKind::KeywordMention => "keyword_mention",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown source kind `{0}` (expected timeline_reply, thread_reply or keyword_mention)")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "timeline_reply" | "timeline" => Ok(SourceKind::TimelineReply),
            "thread_reply" | "thread" => Ok(SourceKind::ThreadReply),
            "keyword_mention" | "keyword" => Ok(SourceKind::KeywordMention),
            _ => Err(UnknownSourceKind(s.to_string())),
        }
    }
}

/// Half-open time window `[start, end)` over platform `posted_at` timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Raw item handed from a source fetcher into the collection pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub platform_id: String,
    pub parent_id: Option<String>,
    pub author_handle: String,
    pub author_display_name: String,
    pub body_text: String,
    pub posted_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted record. Rows are written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedItem {
    pub source_kind: SourceKind,
    /// Target that produced the row: monitored handle, thread root id or search expression.
    pub source_detail: String,
    pub platform_id: String,
    pub parent_id: Option<String>,
    pub author_handle: String,
    pub author_display_name: String,
    pub body_text: String,
    pub posted_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub fetch_run_id: Uuid,
}

impl CollectedItem {
    pub fn from_candidate(
        source_kind: SourceKind,
        source_detail: impl Into<String>,
        candidate: Candidate,
        fetch_run_id: Uuid,
    ) -> Self {
        Self {
            source_kind,
            source_detail: source_detail.into(),
            platform_id: candidate.platform_id,
            parent_id: candidate.parent_id,
            author_handle: candidate.author_handle,
            author_display_name: candidate.author_display_name,
            body_text: candidate.body_text,
            posted_at: candidate.posted_at,
            captured_at: candidate.fetched_at,
            fetch_run_id,
        }
    }
}
