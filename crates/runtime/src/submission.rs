//! One user submission in flight at a time.

use std::collections::VecDeque;

use uuid::Uuid;
use wire::ChannelKey;

/// A queued outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: Uuid,
    pub text: String,
    /// Auxiliary context sent alongside the text.
    pub context: Option<String>,
    pub channel: ChannelKey,
}

impl Submission {
    pub fn new(channel: ChannelKey, text: impl Into<String>, context: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            context,
            channel,
        }
    }
}

/// FIFO of submissions with at most one in flight.
#[derive(Debug, Default)]
pub struct SubmissionQueue {
    in_flight: Option<Submission>,
    pending: VecDeque<Submission>,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a submission. Returns it back if it should start right away.
    pub fn submit(&mut self, submission: Submission) -> Option<Submission> {
        if self.in_flight.is_some() {
            self.pending.push_back(submission);
            return None;
        }
        self.in_flight = Some(submission.clone());
        Some(submission)
    }

    /// The in-flight submission `id` finished, successfully or not. Returns
    /// the next one to start. Unknown ids are ignored.
    pub fn complete(&mut self, id: Uuid) -> Option<Submission> {
        if self.in_flight.as_ref().map(|s| s.id) != Some(id) {
            return None;
        }
        self.in_flight = self.pending.pop_front();
        self.in_flight.clone()
    }

    pub fn in_flight(&self) -> Option<&Submission> {
        self.in_flight.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything. Returns how many submissions were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.in_flight.is_some());
        self.in_flight = None;
        self.pending.clear();
        dropped
    }
}
