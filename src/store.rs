//! Turn persistence.
//!
//! The store is append-only: turns are created once and never mutated. Two
//! backends ship behind the same trait: an in-memory map for tests and
//! ephemeral deployments, and SQLite for anything that should survive a
//! restart. `append` does not return until the backend has accepted the
//! write, so a crash never loses an acknowledged turn on the durable backend.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTurnStore;
pub use sqlite::SqliteTurnStore;

use crate::error::Result;
use crate::{ThreadId, Turn, TurnContent, TurnId, TurnRole};
use async_trait::async_trait;

/// Append-only, per-thread log of conversation turns.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Append a turn and return its fresh id. Ids are strictly increasing
    /// within a thread. Fails with `StoreError::InvalidParent` if `parent_id`
    /// names a turn the thread does not contain.
    async fn append(
        &self,
        thread_id: &ThreadId,
        role: TurnRole,
        content: TurnContent,
        parent_id: Option<TurnId>,
    ) -> Result<TurnId>;

    /// Fetch a single turn. Fails with `StoreError::NotFound` if absent.
    async fn get(&self, thread_id: &ThreadId, turn_id: TurnId) -> Result<Turn>;

    /// All turns whose parent is `parent_id`, in creation order. Empty if
    /// none; a childless turn is not an error.
    async fn children(&self, thread_id: &ThreadId, parent_id: TurnId) -> Result<Vec<Turn>>;

    /// Every turn of the thread in creation order. The branch index derives
    /// its view from this.
    async fn thread_turns(&self, thread_id: &ThreadId) -> Result<Vec<Turn>>;

    /// Irreversibly delete every turn of the thread. No-op if the thread has
    /// no turns.
    async fn clear(&self, thread_id: &ThreadId) -> Result<()>;
}
