//! In-memory turn store.

use crate::error::{Result, StoreError};
use crate::store::TurnStore;
use crate::{ThreadId, Turn, TurnContent, TurnId, TurnRole};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-thread log plus its id counter. Cleared threads drop the whole entry,
/// so a thread restarts from id 1 after a wipe.
#[derive(Debug, Default)]
struct ThreadLog {
    turns: Vec<Turn>,
    next_id: u64,
}

/// Turn store backed by a process-local map. State dies with the process.
#[derive(Debug, Default)]
pub struct MemoryTurnStore {
    threads: RwLock<HashMap<ThreadId, ThreadLog>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn append(
        &self,
        thread_id: &ThreadId,
        role: TurnRole,
        content: TurnContent,
        parent_id: Option<TurnId>,
    ) -> Result<TurnId> {
        let mut threads = self.threads.write().await;
        let log = threads.entry(thread_id.clone()).or_insert_with(|| ThreadLog {
            turns: Vec::new(),
            next_id: 1,
        });

        if let Some(parent) = parent_id
            && !log.turns.iter().any(|turn| turn.id == parent)
        {
            return Err(StoreError::InvalidParent {
                thread_id: thread_id.clone(),
                parent_id: parent,
            }
            .into());
        }

        let id = TurnId(log.next_id);
        log.next_id += 1;
        log.turns.push(Turn {
            id,
            thread_id: thread_id.clone(),
            role,
            content,
            parent_id,
            created_seq: id.0,
            recorded_at: chrono::Utc::now(),
        });

        tracing::debug!(thread_id = %thread_id, turn_id = %id, role = %role, "turn appended");
        Ok(id)
    }

    async fn get(&self, thread_id: &ThreadId, turn_id: TurnId) -> Result<Turn> {
        let threads = self.threads.read().await;
        threads
            .get(thread_id)
            .and_then(|log| log.turns.iter().find(|turn| turn.id == turn_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound {
                    thread_id: thread_id.clone(),
                    turn_id,
                }
                .into()
            })
    }

    async fn children(&self, thread_id: &ThreadId, parent_id: TurnId) -> Result<Vec<Turn>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|log| {
                log.turns
                    .iter()
                    .filter(|turn| turn.parent_id == Some(parent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn thread_turns(&self, thread_id: &ThreadId) -> Result<Vec<Turn>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|log| log.turns.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        let removed = self.threads.write().await.remove(thread_id).is_some();
        if removed {
            tracing::info!(thread_id = %thread_id, "thread history cleared");
        }
        Ok(())
    }
}
