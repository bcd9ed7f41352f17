//! Branch line derivation.
//!
//! A branch line is the ordered set of sibling assistant replies under the
//! thread's current input turn, i.e. the units the navigation cursor pages over.
//! It is recomputed from the turn log on every query, never cached, so
//! regenerations by other callers are always visible.

use crate::error::Result;
use crate::store::TurnStore;
use crate::{ThreadId, Turn, TurnId, TurnRole};
use std::sync::Arc;

/// Reference to one assistant reply eligible for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub turn_id: TurnId,
}

/// Derived, read-only view over a turn store.
#[derive(Clone)]
pub struct BranchIndex {
    store: Arc<dyn TurnStore>,
}

impl BranchIndex {
    pub fn new(store: Arc<dyn TurnStore>) -> Self {
        Self { store }
    }

    /// The currently-navigable branch line for a thread, oldest reply first.
    /// Empty when the thread has no input turns yet, or when the newest input
    /// turn has no completed replies (generation in flight or failed).
    pub async fn current_branch_line(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        let turns = self.store.thread_turns(thread_id).await?;
        Ok(branch_line_of(&turns))
    }
}

/// Assistant children of `parent` that are displayable: tool turns are never
/// checkpoints, and a reply with empty content is still pending or failed.
fn displayable_children(turns: &[Turn], parent: TurnId) -> Vec<&Turn> {
    turns
        .iter()
        .filter(|turn| {
            turn.parent_id == Some(parent)
                && turn.role == TurnRole::Assistant
                && !turn.content.is_empty()
        })
        .collect()
}

/// The input turn the current branch line hangs off.
///
/// Walks the log newest-first, skipping assistant and tool turns. A system
/// turn only anchors if it already has displayable replies (system turns are
/// appended as siblings of the human input and normally have none). The
/// first human turn encountered anchors unconditionally: once a fresh human
/// turn lands, older branch lines are unreachable even while its own reply
/// is still in flight.
pub fn branch_anchor(turns: &[Turn]) -> Option<&Turn> {
    for turn in turns.iter().rev() {
        match turn.role {
            TurnRole::Assistant | TurnRole::Tool => continue,
            TurnRole::Human => return Some(turn),
            TurnRole::System => {
                if !displayable_children(turns, turn.id).is_empty() {
                    return Some(turn);
                }
            }
        }
    }
    None
}

/// Branch line over an in-order turn log. Oldest reply first.
pub fn branch_line_of(turns: &[Turn]) -> Vec<Checkpoint> {
    let Some(anchor) = branch_anchor(turns) else {
        return Vec::new();
    };
    displayable_children(turns, anchor.id)
        .into_iter()
        .map(|turn| Checkpoint {
            thread_id: turn.thread_id.clone(),
            turn_id: turn.id,
        })
        .collect()
}
