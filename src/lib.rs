//! Conversation core for a chat assistant bridging a chat platform to a
//! generative-AI backend.
//!
//! The interesting part lives in the turn store / branch / cursor stack:
//! every exchange is persisted as an immutable [`Turn`], regenerating a reply
//! appends a sibling branch under the same input turn, and a per-thread
//! cursor pages over those branches with strict bounds. [`ConversationService`]
//! is the only entry point the platform gateway and UI layers call.

pub mod branch;
pub mod config;
pub mod cursor;
pub mod error;
pub mod generate;
pub mod reply;
pub mod service;
pub mod store;
pub mod thread_key;

pub use branch::{BranchIndex, Checkpoint};
pub use config::{BotConfig, RetryPolicy, SettingsStore};
pub use cursor::Cursor;
pub use generate::{GenerationSettings, Generator};
pub use service::{ConversationService, PageOutcome};
pub use store::{MemoryTurnStore, SqliteTurnStore, TurnStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable identifier for one conversational context (a channel, DM, or
/// guild+channel pair). Cheap to clone and share across tasks.
pub type ThreadId = Arc<str>;

/// Identifier for a single turn, monotonically increasing within its thread.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for TurnId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Human,
    System,
    Assistant,
    Tool,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::Human => "human",
            TurnRole::System => "system",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(TurnRole::Human),
            "system" => Some(TurnRole::System),
            "assistant" => Some(TurnRole::Assistant),
            "tool" => Some(TurnRole::Tool),
            _ => None,
        }
    }

    /// Input turns are the ones assistant replies attach to.
    pub fn is_input(&self) -> bool {
        matches!(self, TurnRole::Human | TurnRole::System)
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One segment of a turn's content. Media segments carry a reference, not
/// bytes; attachment download is the gateway's problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Media { mime: String, url: String },
}

/// Ordered content of a turn. Never mutated after the turn is appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnContent(pub Vec<Segment>);

impl TurnContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self(vec![Segment::Text { text: text.into() }])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Concatenated text of every text segment.
    pub fn joined_text(&self) -> String {
        let parts: Vec<&str> = self
            .0
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text { text } => Some(text.as_str()),
                Segment::Media { .. } => None,
            })
            .collect();
        parts.join("\n")
    }

    /// A turn with no media and no non-whitespace text counts as empty.
    /// Empty assistant turns are never eligible navigation checkpoints.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|segment| match segment {
            Segment::Text { text } => text.trim().is_empty(),
            Segment::Media { .. } => false,
        })
    }
}

impl From<&str> for TurnContent {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for TurnContent {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

/// One stored exchange step. Turns form a forest per thread: every non-root
/// turn has exactly one parent, and regeneration siblings share theirs.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: TurnId,
    pub thread_id: ThreadId,
    pub role: TurnRole,
    pub content: TurnContent,
    pub parent_id: Option<TurnId>,
    /// Logical creation sequence within the thread. Ordering is defined by
    /// this value alone, never by wall-clock time.
    pub created_seq: u64,
    /// Wall-clock capture time, for audit display only.
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}
