//! Session naming from the first user prompt.
//!
//! A session gets a display name derived from its first real user message,
//! unless the user already named it. Bootstrap/system prompts injected by
//! agent tooling are filtered out rather than turned into names.

use std::collections::HashSet;
use std::sync::Mutex;

pub fn name_from_first_prompt(prompt: &str) -> Option<String> {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || is_bootstrap_prompt(&normalized) {
        return None;
    }

    let max_chars = 72;
    let mut out = String::new();
    for ch in normalized.chars().take(max_chars) {
        out.push(ch);
    }
    if normalized.chars().count() > max_chars {
        out.push('…');
    }
    Some(out)
}

fn is_bootstrap_prompt(message: &str) -> bool {
    message.contains("<environment_context>")
        || message.contains("<system_instructions>")
        || message.contains("AGENTS.md instructions for")
}

/// Dedup guard — ensures each session is only auto-named once per server
/// lifetime.
pub struct NamingGuard {
    claimed: Mutex<HashSet<String>>,
}

impl NamingGuard {
    pub fn new() -> Self {
        Self {
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Try to claim naming rights for a session. Returns true if this is the
    /// first claim.
    pub fn try_claim(&self, session_id: &str) -> bool {
        self.claimed.lock().unwrap().insert(session_id.to_string())
    }
}
