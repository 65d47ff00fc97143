use std::collections::VecDeque;

use crate::backup::ChatSnapshot;
use crate::{ChatMessage, Timestamp};

/// A room's rolling chat buffer. Ids are monotonic per room so clients can
/// merge incremental updates by set-union.
#[derive(Debug)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    next_id: u64,
    limit: usize,
}

impl ChatLog {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            next_id: 1,
            limit,
        }
    }

    /// Appends a message, evicting the oldest entry once full.
    /// Returns None when the text is empty after trimming.
    pub fn push(
        &mut self,
        client_id: &str,
        username: &str,
        country_code: Option<String>,
        text: &str,
        now: Timestamp,
    ) -> Option<ChatMessage> {
        let text = text.trim();

        if text.is_empty() {
            return None;
        }

        let message = ChatMessage {
            id: self.next_id,
            client_id: client_id.to_string(),
            username: username.to_string(),
            text: text.to_string(),
            timestamp: now,
            country_code,
        };

        self.next_id += 1;
        self.messages.push_back(message.clone());

        while self.messages.len() > self.limit {
            self.messages.pop_front();
        }

        Some(message)
    }

    /// The id of the most recent message, or 0 when the log is empty.
    pub fn newest_id(&self) -> u64 {
        self.messages.back().map(|m| m.id).unwrap_or(0)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages(),
            next_message_id: self.next_id,
        }
    }

    pub fn restore(snapshot: ChatSnapshot, limit: usize) -> Self {
        Self {
            next_id: snapshot.next_message_id.max(1),
            messages: snapshot.messages.into_iter().collect(),
            limit,
        }
    }
}
