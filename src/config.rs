//! Bot configuration: generation settings per thread, retry policy, and the
//! JSON settings file behind them.
//!
//! Readers grab a consistent snapshot through `ArcSwap` without taking a
//! lock; writers clone, mutate, swap, and persist under a save lock so two
//! commands can't interleave their file writes.

use crate::error::Result;
use crate::generate::GenerationSettings;
use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite";
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI assistant in a group chat with multiple users.";

/// Bounded retry with increasing backoff for transient generation failures.
/// The schedule is fixed; only the attempt cap is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryPolicy {
    /// Total attempts, including the first. 1 disables retries.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many have already failed.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let secs = match failed_attempts {
            0 | 1 => 1,
            2 => 2,
            3 => 5,
            _ => 10,
        };
        Duration::from_secs(secs)
    }
}

/// Everything the settings file holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BotConfig {
    /// Substituted for `$name` in system prompts.
    pub bot_name: String,
    pub default_model: String,
    pub default_system_prompt: String,
    /// Per-thread model overrides, keyed by thread id.
    pub thread_models: HashMap<String, String>,
    /// Per-thread system prompt overrides, keyed by thread id.
    pub thread_system_prompts: HashMap<String, String>,
    pub retry: RetryPolicy,
    /// Cap on a single generation call. `None` waits indefinitely.
    pub generation_timeout_secs: Option<u64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_name: "braidbot".into(),
            default_model: DEFAULT_MODEL.into(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            thread_models: HashMap::new(),
            thread_system_prompts: HashMap::new(),
            retry: RetryPolicy::default(),
            generation_timeout_secs: Some(120),
        }
    }
}

/// Live settings handle. Cheap to clone a snapshot from; mutations persist
/// to the backing file when one is configured.
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: ArcSwap<BotConfig>,
    save_lock: Mutex<()>,
}

impl SettingsStore {
    /// Settings with no backing file. Mutations stay in memory.
    pub fn in_memory(config: BotConfig) -> Self {
        Self {
            path: None,
            current: ArcSwap::from_pointee(config),
            save_lock: Mutex::new(()),
        }
    }

    /// Load settings from a JSON file, creating it with defaults if absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("settings file {} is not valid JSON", path.display()))?
        } else {
            let config = BotConfig::default();
            let raw = serde_json::to_string_pretty(&config)
                .with_context(|| "failed to encode default settings")?;
            std::fs::write(&path, raw)
                .with_context(|| format!("failed to create settings file {}", path.display()))?;
            config
        };

        Ok(Self {
            path: Some(path),
            current: ArcSwap::from_pointee(config),
            save_lock: Mutex::new(()),
        })
    }

    /// Current snapshot.
    pub fn config(&self) -> Arc<BotConfig> {
        self.current.load_full()
    }

    /// Generation settings for one thread: its model override or the
    /// default, and its system prompt with `$name` substituted. A prompt
    /// without the placeholder gets the bot's name appended so the model
    /// always knows what it is called.
    pub fn generation_settings(&self, thread_id: &str) -> GenerationSettings {
        let config = self.current.load();
        let model = config
            .thread_models
            .get(thread_id)
            .cloned()
            .unwrap_or_else(|| config.default_model.clone());

        let mut prompt = config
            .thread_system_prompts
            .get(thread_id)
            .cloned()
            .unwrap_or_else(|| config.default_system_prompt.clone());
        if !prompt.contains("$name") {
            prompt.push_str(" Your name is $name.");
        }
        let system_prompt = prompt.replace("$name", &config.bot_name);

        GenerationSettings {
            model,
            system_prompt,
        }
    }

    /// Override the model for one thread.
    pub async fn set_thread_model(&self, thread_id: &str, model: &str) -> Result<()> {
        self.update(|config| {
            config
                .thread_models
                .insert(thread_id.to_string(), model.to_string());
        })
        .await
    }

    /// Override the system prompt for one thread.
    pub async fn set_thread_system_prompt(&self, thread_id: &str, prompt: &str) -> Result<()> {
        self.update(|config| {
            config
                .thread_system_prompts
                .insert(thread_id.to_string(), prompt.to_string());
        })
        .await
    }

    /// Drop every override for a thread, falling back to defaults.
    pub async fn reset_thread(&self, thread_id: &str) -> Result<()> {
        self.update(|config| {
            config.thread_models.remove(thread_id);
            config.thread_system_prompts.remove(thread_id);
        })
        .await
    }

    async fn update(&self, mutate: impl FnOnce(&mut BotConfig)) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let mut config = (*self.current.load_full()).clone();
        mutate(&mut config);

        if let Some(path) = &self.path {
            let raw = serde_json::to_string_pretty(&config)
                .with_context(|| "failed to encode settings")?;
            std::fs::write(path, raw)
                .with_context(|| format!("failed to write settings file {}", path.display()))?;
        }

        self.current.store(Arc::new(config));
        Ok(())
    }
}
