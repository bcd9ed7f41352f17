//! Console driver for the conversation core.
//!
//! Runs the service against a canned generation backend so the branch and
//! navigation behavior can be exercised without a platform gateway or model
//! credentials. Commands: plain text submits a message, `/regen`, `/back`,
//! `/next`, `/clear`, `/quit`.

use async_trait::async_trait;
use braidbot::error::GenerationError;
use braidbot::{
    BotConfig, ConversationService, GenerationSettings, Generator, MemoryTurnStore, SettingsStore,
    ThreadId, Turn, TurnContent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Echoes the latest human input back with a counter, so regenerations are
/// visibly distinct while paging.
struct CannedGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for CannedGenerator {
    async fn generate(
        &self,
        history: &[Turn],
        settings: &GenerationSettings,
    ) -> Result<TurnContent, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let last_input = history
            .iter()
            .rev()
            .find(|turn| turn.role == braidbot::TurnRole::Human)
            .map(|turn| turn.content.joined_text())
            .unwrap_or_default();
        Ok(TurnContent::text(format!(
            "[{} #{call}] you said: {last_input}",
            settings.model
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let store = Arc::new(MemoryTurnStore::new());
    let settings = Arc::new(SettingsStore::in_memory(BotConfig::default()));
    let generator = Arc::new(CannedGenerator {
        calls: AtomicUsize::new(0),
    });
    let service = ConversationService::new(store, generator, settings);
    let thread: ThreadId = Arc::from("console");

    println!("braidbot console: /regen, /back, /next, /clear, /quit");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" => break,
            "/regen" => match service.regenerate(&thread).await {
                Ok(content) => print_reply(&service, &thread, &content.joined_text()).await,
                Err(error) => println!("! {error}"),
            },
            "/back" => match service.page_backward(&thread).await {
                Ok(outcome) => print_reply(&service, &thread, &outcome.to_string()).await,
                Err(error) => println!("! {error}"),
            },
            "/next" => match service.page_forward(&thread).await {
                Ok(outcome) => print_reply(&service, &thread, &outcome.to_string()).await,
                Err(error) => println!("! {error}"),
            },
            "/clear" => match service.clear(&thread).await {
                Ok(()) => println!("(conversation forgotten)"),
                Err(error) => println!("! {error}"),
            },
            text => match service.submit(&thread, text.into(), None).await {
                Ok(content) => print_reply(&service, &thread, &content.joined_text()).await,
                Err(error) => println!("! {error}"),
            },
        }
    }

    Ok(())
}

async fn print_reply(service: &ConversationService, thread: &ThreadId, text: &str) {
    let label = service
        .position_label(thread)
        .await
        .unwrap_or_else(|_| "?".into());
    for chunk in braidbot::reply::split_chunks(text, 2000) {
        println!("[{label}] {chunk}");
    }
}
