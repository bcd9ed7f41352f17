//! Mapping from a platform conversation context to a stable thread id.

use crate::ThreadId;
use std::sync::Arc;

/// The platform-side coordinates of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformContext {
    /// Present for guild channels, absent for DMs.
    pub guild_id: Option<u64>,
    pub channel_id: u64,
}

/// Guild channels key on `"{guild_id}-{channel_id}"` so the same channel id
/// in two guilds never collides; DMs key on the bare channel id.
pub fn thread_id_for(context: &PlatformContext) -> ThreadId {
    match context.guild_id {
        Some(guild_id) => Arc::from(format!("{guild_id}-{}", context.channel_id).as_str()),
        None => Arc::from(context.channel_id.to_string().as_str()),
    }
}
