use std::collections::VecDeque;

use super::messages::SignalingMessage;

/// Outbound messages held until the relay registration completes.
#[derive(Debug, Default)]
pub struct PendingQueue {
    messages: VecDeque<SignalingMessage>,
}

impl PendingQueue {
    pub fn push(&mut self, message: SignalingMessage) {
        self.messages.push_back(message);
    }

    /// Takes every queued message, oldest first.
    pub fn drain(&mut self) -> std::collections::vec_deque::IntoIter<SignalingMessage> {
        std::mem::take(&mut self.messages).into_iter()
    }

    /// Drops everything still queued and returns how many were lost.
    pub fn discard(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
