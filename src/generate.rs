//! Generation seam.
//!
//! The model call itself lives outside this crate. The service only sees an
//! async function from (turn history, settings) to reply content, with
//! failures sorted into the categories the retry policy cares about.

use crate::error::GenerationError;
use crate::{Turn, TurnContent};
use async_trait::async_trait;

/// Per-invocation settings resolved from configuration. Read-only input to
/// the generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSettings {
    pub model: String,
    pub system_prompt: String,
}

/// Opaque generation backend.
///
/// `history` is the thread's turns in creation order; the backend decides
/// how to render roles into its own prompt format. Implementations must be
/// cancel-safe: dropping the future mid-flight must not leave anything the
/// caller has to clean up.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        history: &[Turn],
        settings: &GenerationSettings,
    ) -> std::result::Result<TurnContent, GenerationError>;
}
