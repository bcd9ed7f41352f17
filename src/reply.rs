//! Reply post-processing: reasoning-tag extraction and chunk splitting.
//!
//! Some backends emit their chain of thought wrapped in `<think>` tags ahead
//! of the visible answer, and chat platforms cap message length, so replies
//! are stripped and split before delivery. Both transforms are pure and
//! leave the stored turn content untouched.

/// A reply split into its visible text and any extracted reasoning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedReply {
    pub visible: String,
    pub reasoning: Option<String>,
}

/// Split a raw reply on the closing `</think>` tag. Text after the tag is
/// the visible answer; text before it (minus the opening tag) is the
/// reasoning. Without a closing tag the whole reply is visible, with any
/// stray opening tags dropped.
pub fn extract_reasoning(raw: &str) -> ExtractedReply {
    match raw.split_once("</think>") {
        Some((before, after)) => {
            let reasoning = before.replace("<think>", "").trim().to_string();
            ExtractedReply {
                visible: after.trim().to_string(),
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
            }
        }
        None => ExtractedReply {
            visible: raw.replace("<think>", "").trim().to_string(),
            reasoning: None,
        },
    }
}

/// Split text into chunks of at most `chunk_size` characters, breaking on
/// whitespace. A single word longer than the chunk size is hard-split
/// rather than overflowing the platform limit.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    assert!(chunk_size > 0, "chunk_size must be positive");

    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word;
        // Hard-split words that cannot fit in any chunk.
        while word.chars().count() > chunk_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let split_at = word
                .char_indices()
                .nth(chunk_size)
                .map(|(offset, _)| offset)
                .unwrap_or(word.len());
            chunks.push(word[..split_at].to_string());
            word = &word[split_at..];
        }

        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > chunk_size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
