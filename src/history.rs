use std::collections::HashMap;

use crate::provider::{ContinuationToken, ConversationTurn};

/// Non-system turns kept after each round.
pub const DEFAULT_HISTORY_CEILING: usize = 6;

/// Stored in place of an assistant reply that produced no text.
pub const NO_RESPONSE_PLACEHOLDER: &str = "[no response]";

/// One conversation thread. Index 0 is always the system turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    turns: Vec<ConversationTurn>,
    continuation: Option<ContinuationToken>,
    ceiling: usize,
}

impl Session {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![ConversationTurn::system(system_prompt)],
            continuation: None,
            ceiling: DEFAULT_HISTORY_CEILING,
        }
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self.truncate();
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn system_turn(&self) -> &ConversationTurn {
        &self.turns[0]
    }

    pub fn last_turn(&self) -> Option<&ConversationTurn> {
        self.turns[1..].last()
    }

    pub fn continuation(&self) -> Option<&ContinuationToken> {
        self.continuation.as_ref()
    }

    pub fn push_user(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    /// Close a round: append the assistant turn, keep the newest
    /// continuation token, then truncate.
    pub fn record_reply(&mut self, text: &str, continuation: Option<ContinuationToken>) {
        let content = if text.trim().is_empty() {
            NO_RESPONSE_PLACEHOLDER
        } else {
            text
        };
        self.turns.push(ConversationTurn::assistant(content));
        if continuation.is_some() {
            self.continuation = continuation;
        }
        self.truncate();
    }

    /// Drop the oldest turns after index 0 until at most `ceiling` remain.
    pub fn truncate(&mut self) {
        let excess = (self.turns.len() - 1).saturating_sub(self.ceiling);
        if excess > 0 {
            self.turns.drain(1..=excess);
            tracing::debug!(dropped = excess, kept = self.turns.len(), "truncated session history");
        }
    }

    /// Forget everything except the system turn.
    pub fn clear(&mut self) {
        self.turns.truncate(1);
        self.continuation = None;
    }
}

/// Caller-owned sessions keyed by thread id.
#[derive(Debug, Clone)]
pub struct SessionBook {
    system_prompt: String,
    ceiling: usize,
    sessions: HashMap<String, Session>,
}

impl SessionBook {
    pub fn new(system_prompt: impl Into<String>, ceiling: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ceiling,
            sessions: HashMap::new(),
        }
    }

    /// The thread's session, created on first use.
    pub fn session(&mut self, thread_id: &str) -> &mut Session {
        let (prompt, ceiling) = (&self.system_prompt, self.ceiling);
        self.sessions
            .entry(thread_id.to_string())
            .or_insert_with(|| Session::new(prompt.clone()).with_ceiling(ceiling))
    }

    pub fn get(&self, thread_id: &str) -> Option<&Session> {
        self.sessions.get(thread_id)
    }

    /// Returns false if the thread has no session yet.
    pub fn clear(&mut self, thread_id: &str) -> bool {
        match self.sessions.get_mut(thread_id) {
            Some(session) => {
                session.clear();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, thread_id: &str) -> Option<Session> {
        self.sessions.remove(thread_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
