//! Conversation façade.
//!
//! The only component the gateway and UI layers call. Every operation on a
//! thread runs under that thread's lock, so a regenerate and a navigation
//! click for the same thread can never interleave their store mutations or
//! cursor transitions. The lock is keyed per thread, so operations on
//! different threads never wait on each other.
//!
//! The per-thread lock is held across the generation await on purpose: it
//! guarantees at most one in-flight generation per thread, with a second
//! regenerate queuing behind the first instead of racing it.

use crate::branch::{BranchIndex, branch_anchor, branch_line_of};
use crate::config::SettingsStore;
use crate::cursor::Cursor;
use crate::error::{Error, GenerationError, NavError, Result};
use crate::generate::Generator;
use crate::store::TurnStore;
use crate::{ThreadId, Turn, TurnContent, TurnId, TurnRole};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of a paging action. Boundary hits are answers, not errors; the
/// UI renders them as-is instead of handling an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Reply(TurnContent),
    NoEarlierReply,
    NoLaterReply,
}

impl PageOutcome {
    pub fn content(&self) -> Option<&TurnContent> {
        match self {
            PageOutcome::Reply(content) => Some(content),
            _ => None,
        }
    }
}

impl std::fmt::Display for PageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageOutcome::Reply(content) => f.write_str(&content.joined_text()),
            PageOutcome::NoEarlierReply => f.write_str("No earlier reply."),
            PageOutcome::NoLaterReply => f.write_str("No later reply."),
        }
    }
}

/// Façade over the turn store, branch index, and per-thread cursors.
pub struct ConversationService {
    store: Arc<dyn TurnStore>,
    branches: BranchIndex,
    generator: Arc<dyn Generator>,
    settings: Arc<SettingsStore>,
    /// Per-thread cursor behind its per-thread lock. The outer map lock is
    /// only held long enough to clone the entry out.
    threads: Mutex<HashMap<ThreadId, Arc<Mutex<Cursor>>>>,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn TurnStore>,
        generator: Arc<dyn Generator>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            branches: BranchIndex::new(store.clone()),
            store,
            generator,
            settings,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a fresh user message: append the input turns, generate a
    /// reply, and reset navigation to the new single-reply branch line.
    ///
    /// The optional system input is appended as a sibling of the human turn.
    /// On generation failure no assistant turn is appended and the error is
    /// surfaced; the cursor is still reset, because the new input turn has
    /// already made the old branches unreachable.
    #[tracing::instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn submit(
        &self,
        thread_id: &ThreadId,
        human_input: TurnContent,
        system_input: Option<&str>,
    ) -> Result<TurnContent> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let mut cursor = cursor_lock.lock().await;

        let turns = self.store.thread_turns(thread_id).await?;

        // The new input responds to whatever reply the user was looking at;
        // with no cursor it chains onto the newest turn, or starts a root.
        let line = branch_line_of(&turns);
        let parent = cursor
            .index()
            .filter(|index| *index < line.len())
            .map(|index| line[index].turn_id)
            .or_else(|| turns.last().map(|turn| turn.id));

        let human_id = self
            .store
            .append(thread_id, TurnRole::Human, human_input, parent)
            .await?;
        if let Some(system) = system_input.filter(|input| !input.trim().is_empty()) {
            self.store
                .append(thread_id, TurnRole::System, TurnContent::text(system), parent)
                .await?;
        }

        cursor.reset();

        let history = self.store.thread_turns(thread_id).await?;
        let content = self.generate_with_retry(thread_id, &history).await?;

        self.store
            .append(
                thread_id,
                TurnRole::Assistant,
                content.clone(),
                Some(human_id),
            )
            .await?;
        let line = self.branches.current_branch_line(thread_id).await?;
        cursor.select_latest(line.len()).map_err(Error::Nav)?;

        Ok(content)
    }

    /// Re-run generation for the current input turn and append the result as
    /// a sibling reply. The cursor lands on the new (newest) branch. On
    /// failure the store, branch line, and cursor are exactly as before.
    #[tracing::instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn regenerate(&self, thread_id: &ThreadId) -> Result<TurnContent> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let mut cursor = cursor_lock.lock().await;

        let turns = self.store.thread_turns(thread_id).await?;
        let anchor = branch_anchor(&turns).ok_or(Error::Nav(NavError::EmptyBranch))?;
        let anchor_id = anchor.id;

        let history = history_for_regeneration(&turns, anchor_id);
        let content = self.generate_with_retry(thread_id, &history).await?;

        self.store
            .append(
                thread_id,
                TurnRole::Assistant,
                content.clone(),
                Some(anchor_id),
            )
            .await?;
        let line = self.branches.current_branch_line(thread_id).await?;
        cursor.select_latest(line.len()).map_err(Error::Nav)?;

        Ok(content)
    }

    /// Move to the previous (older) reply and return it.
    #[tracing::instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn page_backward(&self, thread_id: &ThreadId) -> Result<PageOutcome> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let mut cursor = cursor_lock.lock().await;

        let line = self.branches.current_branch_line(thread_id).await?;
        match cursor.backward(line.len()) {
            Ok(index) => {
                let turn = self.store.get(thread_id, line[index].turn_id).await?;
                Ok(PageOutcome::Reply(turn.content))
            }
            Err(_) => Ok(PageOutcome::NoEarlierReply),
        }
    }

    /// Move to the next (newer) reply and return it.
    #[tracing::instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn page_forward(&self, thread_id: &ThreadId) -> Result<PageOutcome> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let mut cursor = cursor_lock.lock().await;

        let line = self.branches.current_branch_line(thread_id).await?;
        match cursor.forward(line.len()) {
            Ok(index) => {
                let turn = self.store.get(thread_id, line[index].turn_id).await?;
                Ok(PageOutcome::Reply(turn.content))
            }
            Err(_) => Ok(PageOutcome::NoLaterReply),
        }
    }

    /// Enablement for the "previous reply" control.
    pub async fn can_go_backward(&self, thread_id: &ThreadId) -> Result<bool> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let cursor = cursor_lock.lock().await;
        let line = self.branches.current_branch_line(thread_id).await?;
        Ok(cursor.can_go_backward(line.len()))
    }

    /// Enablement for the "next reply" control.
    pub async fn can_go_forward(&self, thread_id: &ThreadId) -> Result<bool> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let cursor = cursor_lock.lock().await;
        let line = self.branches.current_branch_line(thread_id).await?;
        Ok(cursor.can_go_forward(line.len()))
    }

    /// Position indicator for the navigation UI, e.g. `"2/3"`.
    pub async fn position_label(&self, thread_id: &ThreadId) -> Result<String> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let cursor = cursor_lock.lock().await;
        let line = self.branches.current_branch_line(thread_id).await?;
        Ok(cursor.position_label(line.len()))
    }

    /// Forget the whole conversation. The next submit starts from scratch.
    #[tracing::instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        let cursor_lock = self.thread_cursor(thread_id).await;
        let mut cursor = cursor_lock.lock().await;
        self.store.clear(thread_id).await?;
        cursor.reset();
        Ok(())
    }

    async fn thread_cursor(&self, thread_id: &ThreadId) -> Arc<Mutex<Cursor>> {
        let mut threads = self.threads.lock().await;
        threads.entry(thread_id.clone()).or_default().clone()
    }

    /// Invoke the backend, retrying transient and rate-limit failures with
    /// backoff up to the configured attempt cap. A reply with no content is
    /// treated as a failure; an empty checkpoint must never be stored.
    async fn generate_with_retry(
        &self,
        thread_id: &ThreadId,
        history: &[Turn],
    ) -> Result<TurnContent> {
        let settings = self.settings.generation_settings(thread_id.as_ref());
        let config = self.settings.config();
        let request_id = Uuid::new_v4();
        let mut failed_attempts = 0u32;

        loop {
            tracing::debug!(
                %request_id,
                model = %settings.model,
                attempt = failed_attempts + 1,
                "invoking generation backend"
            );

            let call = self.generator.generate(history, &settings);
            let result = match config.generation_timeout_secs {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), call).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Server(format!(
                        "generation timed out after {secs}s"
                    ))),
                },
                None => call.await,
            };

            match result {
                Ok(content) if content.is_empty() => {
                    tracing::error!(%request_id, "backend returned an empty reply");
                    return Err(GenerationError::Unknown(
                        "backend returned an empty reply".into(),
                    )
                    .into());
                }
                Ok(content) => return Ok(content),
                Err(error)
                    if error.is_retryable() && failed_attempts + 1 < config.retry.max_attempts =>
                {
                    failed_attempts += 1;
                    let delay = config.retry.delay_for(failed_attempts);
                    tracing::warn!(
                        %request_id,
                        %error,
                        retry_in_secs = delay.as_secs(),
                        "generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::error!(%request_id, %error, "generation failed");
                    return Err(error.into());
                }
            }
        }
    }
}

/// The log as it looked when the anchor's input was submitted: everything
/// except the anchor's reply branches and whatever hangs off them. Turns are
/// in creation order, so parents are always seen before children.
fn history_for_regeneration(turns: &[Turn], anchor_id: TurnId) -> Vec<Turn> {
    let mut excluded: HashSet<TurnId> = HashSet::new();
    for turn in turns {
        let under_anchor = turn.parent_id == Some(anchor_id) && !turn.role.is_input();
        let under_excluded = turn
            .parent_id
            .is_some_and(|parent| excluded.contains(&parent));
        if under_anchor || under_excluded {
            excluded.insert(turn.id);
        }
    }
    turns
        .iter()
        .filter(|turn| !excluded.contains(&turn.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::generate::GenerationSettings;
    use crate::store::MemoryTurnStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a scripted sequence of outcomes, then falls back to counted
    /// `"reply N"` contents once the script is exhausted.
    struct ScriptedGenerator {
        script: StdMutex<VecDeque<std::result::Result<TurnContent, GenerationError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedGenerator {
        fn counting() -> Self {
            Self::with_script(Vec::new())
        }

        fn with_script(
            script: Vec<std::result::Result<TurnContent, GenerationError>>,
        ) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            _history: &[Turn],
            _settings: &GenerationSettings,
        ) -> std::result::Result<TurnContent, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.script.lock().expect("script lock").pop_front();
            match scripted {
                Some(outcome) => outcome,
                None => Ok(TurnContent::text(format!("reply {call}"))),
            }
        }
    }

    fn harness(
        generator: Arc<ScriptedGenerator>,
    ) -> (ConversationService, Arc<MemoryTurnStore>, ThreadId) {
        let store = Arc::new(MemoryTurnStore::new());
        let settings = Arc::new(SettingsStore::in_memory(BotConfig::default()));
        let service = ConversationService::new(store.clone(), generator, settings);
        (service, store, Arc::from("thread-1"))
    }

    #[tokio::test]
    async fn submit_resets_navigation_to_a_single_reply() {
        let (service, _, thread) = harness(Arc::new(ScriptedGenerator::counting()));

        let reply = service
            .submit(&thread, "hi".into(), Some("be nice"))
            .await
            .expect("submit should succeed");
        assert_eq!(reply.joined_text(), "reply 1");

        assert!(!service.can_go_backward(&thread).await.expect("query should succeed"));
        assert!(!service.can_go_forward(&thread).await.expect("query should succeed"));
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "1/1"
        );
    }

    #[tokio::test]
    async fn scenario_submit_regenerate_and_page() {
        let (service, _, thread) = harness(Arc::new(ScriptedGenerator::counting()));

        let first = service
            .submit(&thread, "hi".into(), Some("be nice"))
            .await
            .expect("submit should succeed");

        let second = service
            .regenerate(&thread)
            .await
            .expect("regenerate should succeed");
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "2/2"
        );
        assert!(service.can_go_backward(&thread).await.expect("query should succeed"));
        assert!(!service.can_go_forward(&thread).await.expect("query should succeed"));

        let back = service
            .page_backward(&thread)
            .await
            .expect("page_backward should succeed");
        assert_eq!(back.content(), Some(&first));
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "1/2"
        );

        let forward = service
            .page_forward(&thread)
            .await
            .expect("page_forward should succeed");
        assert_eq!(forward.content(), Some(&second));

        // Second forward hits the boundary: a sentinel, and the position
        // does not move.
        let at_edge = service
            .page_forward(&thread)
            .await
            .expect("page_forward should succeed");
        assert_eq!(at_edge, PageOutcome::NoLaterReply);
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "2/2"
        );
    }

    #[tokio::test]
    async fn paging_an_empty_thread_is_a_sentinel_not_an_error() {
        let (service, _, thread) = harness(Arc::new(ScriptedGenerator::counting()));

        assert_eq!(
            service
                .page_backward(&thread)
                .await
                .expect("page_backward should succeed"),
            PageOutcome::NoEarlierReply
        );
        assert_eq!(
            service
                .page_forward(&thread)
                .await
                .expect("page_forward should succeed"),
            PageOutcome::NoLaterReply
        );
    }

    #[tokio::test]
    async fn regenerate_without_any_input_fails() {
        let (service, _, thread) = harness(Arc::new(ScriptedGenerator::counting()));
        let error = service
            .regenerate(&thread)
            .await
            .expect_err("regenerate on an empty thread should fail");
        assert!(matches!(error, Error::Nav(NavError::EmptyBranch)));
    }

    #[tokio::test]
    async fn failed_regeneration_leaves_everything_as_it_was() {
        let generator = Arc::new(ScriptedGenerator::with_script(vec![
            Ok(TurnContent::text("only reply")),
            Err(GenerationError::Validation("prompt rejected".into())),
        ]));
        let (service, store, thread) = harness(generator.clone());

        service
            .submit(&thread, "hi".into(), None)
            .await
            .expect("submit should succeed");
        let turns_before = store.thread_turns(&thread).await.expect("turns should load");

        let error = service
            .regenerate(&thread)
            .await
            .expect_err("scripted validation failure should surface");
        assert!(matches!(
            error,
            Error::Generation(GenerationError::Validation(_))
        ));
        // Validation failures are never retried.
        assert_eq!(generator.calls(), 2);

        let turns_after = store.thread_turns(&thread).await.expect("turns should load");
        assert_eq!(turns_after.len(), turns_before.len());
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "1/1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let generator = Arc::new(ScriptedGenerator::with_script(vec![
            Ok(TurnContent::text("first")),
            Err(GenerationError::Server("upstream 500".into())),
            Err(GenerationError::RateLimit("429".into())),
            Ok(TurnContent::text("recovered")),
        ]));
        let (service, _, thread) = harness(generator.clone());

        service
            .submit(&thread, "hi".into(), None)
            .await
            .expect("submit should succeed");
        let reply = service
            .regenerate(&thread)
            .await
            .expect("regenerate should recover after retries");
        assert_eq!(reply.joined_text(), "recovered");
        assert_eq!(generator.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_the_branch_line_empty() {
        let generator = Arc::new(ScriptedGenerator::with_script(vec![
            Err(GenerationError::Server("down".into())),
            Err(GenerationError::Server("down".into())),
            Err(GenerationError::Server("down".into())),
        ]));
        let (service, store, thread) = harness(generator.clone());

        let error = service
            .submit(&thread, "hi".into(), None)
            .await
            .expect_err("submit should fail once retries are exhausted");
        assert!(matches!(
            error,
            Error::Generation(GenerationError::Server(_))
        ));
        assert_eq!(generator.calls(), 3, "default policy allows three attempts");

        // The human turn is recorded, but no assistant turn ever was.
        let turns = store.thread_turns(&thread).await.expect("turns should load");
        assert_eq!(turns.len(), 1);
        assert!(!service.can_go_backward(&thread).await.expect("query should succeed"));
        assert!(!service.can_go_forward(&thread).await.expect("query should succeed"));
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "0/0"
        );
    }

    #[tokio::test]
    async fn empty_backend_reply_is_rejected_not_stored() {
        let generator = Arc::new(ScriptedGenerator::with_script(vec![Ok(
            TurnContent::text("   "),
        )]));
        let (service, store, thread) = harness(generator);

        let error = service
            .submit(&thread, "hi".into(), None)
            .await
            .expect_err("blank reply should be a failure");
        assert!(matches!(
            error,
            Error::Generation(GenerationError::Unknown(_))
        ));
        let turns = store.thread_turns(&thread).await.expect("turns should load");
        assert!(
            turns.iter().all(|turn| turn.role != TurnRole::Assistant),
            "no assistant turn may be stored for a blank reply"
        );
    }

    #[tokio::test]
    async fn follow_up_links_to_the_reply_the_user_was_viewing() {
        let (service, store, thread) = harness(Arc::new(ScriptedGenerator::counting()));

        service
            .submit(&thread, "hi".into(), None)
            .await
            .expect("submit should succeed");
        service
            .regenerate(&thread)
            .await
            .expect("regenerate should succeed");
        service
            .page_backward(&thread)
            .await
            .expect("page_backward should succeed");

        service
            .submit(&thread, "tell me more".into(), None)
            .await
            .expect("second submit should succeed");

        let turns = store.thread_turns(&thread).await.expect("turns should load");
        let first_reply = turns
            .iter()
            .find(|turn| turn.role == TurnRole::Assistant)
            .expect("first reply should exist")
            .id;
        let follow_up = turns
            .iter()
            .filter(|turn| turn.role == TurnRole::Human)
            .next_back()
            .expect("follow-up turn should exist");
        assert_eq!(
            follow_up.parent_id,
            Some(first_reply),
            "the follow-up responds to the reply selected by the cursor"
        );
    }

    #[tokio::test]
    async fn clear_forgets_the_conversation() {
        let (service, _, thread) = harness(Arc::new(ScriptedGenerator::counting()));

        service
            .submit(&thread, "hi".into(), None)
            .await
            .expect("submit should succeed");
        service
            .regenerate(&thread)
            .await
            .expect("regenerate should succeed");

        service.clear(&thread).await.expect("clear should succeed");
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "0/0"
        );

        // A post-wipe submit behaves like a brand-new thread.
        service
            .submit(&thread, "hello again".into(), None)
            .await
            .expect("submit after clear should succeed");
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "1/1"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_regenerations_both_land_as_siblings() {
        let generator =
            Arc::new(ScriptedGenerator::counting().with_delay(Duration::from_millis(20)));
        let (service, store, thread) = harness(generator);
        let service = Arc::new(service);

        service
            .submit(&thread, "hi".into(), None)
            .await
            .expect("submit should succeed");

        let first = {
            let service = service.clone();
            let thread = thread.clone();
            tokio::spawn(async move { service.regenerate(&thread).await })
        };
        let second = {
            let service = service.clone();
            let thread = thread.clone();
            tokio::spawn(async move { service.regenerate(&thread).await })
        };
        first
            .await
            .expect("task should not panic")
            .expect("first regenerate should succeed");
        second
            .await
            .expect("task should not panic")
            .expect("second regenerate should succeed");

        let turns = store.thread_turns(&thread).await.expect("turns should load");
        let replies = turns
            .iter()
            .filter(|turn| turn.role == TurnRole::Assistant)
            .count();
        assert_eq!(replies, 3, "no regeneration may be lost");
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "3/3"
        );
        assert!(!service.can_go_forward(&thread).await.expect("query should succeed"));
    }

    #[tokio::test]
    async fn threads_navigate_independently() {
        let (service, _, _) = harness(Arc::new(ScriptedGenerator::counting()));
        let a: ThreadId = Arc::from("thread-a");
        let b: ThreadId = Arc::from("thread-b");

        service
            .submit(&a, "hi from a".into(), None)
            .await
            .expect("submit should succeed");
        service
            .regenerate(&a)
            .await
            .expect("regenerate should succeed");
        service
            .submit(&b, "hi from b".into(), None)
            .await
            .expect("submit should succeed");

        assert_eq!(
            service.position_label(&a).await.expect("label should compute"),
            "2/2"
        );
        assert_eq!(
            service.position_label(&b).await.expect("label should compute"),
            "1/1"
        );
    }

    #[tokio::test]
    async fn sqlite_backend_runs_the_same_flow() {
        let store = Arc::new(
            crate::store::SqliteTurnStore::in_memory()
                .await
                .expect("in-memory sqlite store should open"),
        );
        let settings = Arc::new(SettingsStore::in_memory(BotConfig::default()));
        let service = ConversationService::new(
            store,
            Arc::new(ScriptedGenerator::counting()),
            settings,
        );
        let thread: ThreadId = Arc::from("sqlite-thread");

        service
            .submit(&thread, "hi".into(), Some("be nice"))
            .await
            .expect("submit should succeed");
        service
            .regenerate(&thread)
            .await
            .expect("regenerate should succeed");
        assert_eq!(
            service.position_label(&thread).await.expect("label should compute"),
            "2/2"
        );
        let back = service
            .page_backward(&thread)
            .await
            .expect("page_backward should succeed");
        assert_eq!(
            back.content().expect("backward step should return a reply").joined_text(),
            "reply 1"
        );
    }
}
