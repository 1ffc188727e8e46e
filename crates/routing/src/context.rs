//! Conversation contexts and the set of all known contexts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wire::{Body, ChannelKey, Event, EventKind};

/// One displayed entry: an event plus the system events that followed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_log: Vec<Event>,
    /// Set once a streamed reply is complete; later chunks start a new entry.
    #[serde(default)]
    pub finalized: bool,
}

impl Entry {
    fn new(event: Event) -> Self {
        // Only assistant replies stream in pieces.
        let finalized = event.kind != EventKind::Assistant;
        Self {
            event,
            system_log: Vec::new(),
            finalized,
        }
    }
}

/// The ordered history of a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    key: ChannelKey,
    entries: Vec<Entry>,
    unread: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

impl ConversationContext {
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            unread: 0,
            conversation_id: None,
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Server-side conversation id, in the per-request model.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn set_conversation_id(&mut self, id: impl Into<String>) {
        self.conversation_id = Some(id.into());
    }

    /// Store a text event, folding assistant continuations into the open
    /// reply even if other entries (an echoed submission) landed after it.
    ///
    /// A chunk from a different sender closes the open reply and starts its
    /// own.
    pub fn push_text(&mut self, event: Event) {
        if event.kind == EventKind::Assistant {
            if let Some(open) = self.open_reply() {
                if open.event.from_user != event.from_user {
                    open.finalized = true;
                } else if let (Body::Text(text), Body::Text(more)) =
                    (&mut open.event.body, &event.body)
                {
                    text.push_str(more);
                    return;
                }
            }
        }
        self.entries.push(Entry::new(event));
    }

    /// Attach a system event to the latest non-system entry.
    pub fn attach_system(&mut self, event: Event) {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| entry.event.kind != EventKind::System)
        {
            Some(entry) => entry.system_log.push(event),
            None => self.entries.push(Entry::new(event)),
        }
    }

    /// Close the reply currently streaming, if any.
    pub fn finalize(&mut self) {
        if let Some(open) = self.open_reply() {
            open.finalized = true;
        }
    }

    /// Only assistant entries are ever unfinalized, and at most one at a time.
    fn open_reply(&mut self) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|entry| !entry.finalized && entry.event.kind == EventKind::Assistant)
    }

    /// Replace local entries with the server's copy of the history.
    pub fn replace_history(&mut self, events: Vec<Event>) {
        self.entries.clear();
        for event in events {
            if event.kind == EventKind::System {
                self.attach_system(event);
            } else {
                self.entries.push(Entry {
                    event,
                    system_log: Vec::new(),
                    finalized: true,
                });
            }
        }
    }

    /// Forget the event sequence and the server conversation.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.conversation_id = None;
    }

    pub(crate) fn bump_unread(&mut self) -> u32 {
        self.unread += 1;
        self.unread
    }

    pub(crate) fn mark_read(&mut self) {
        self.unread = 0;
    }
}

/// Every context the client knows about, plus which one is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversations {
    active: ChannelKey,
    contexts: BTreeMap<ChannelKey, ConversationContext>,
}

impl Conversations {
    pub fn new(active: impl Into<ChannelKey>) -> Self {
        let active = active.into();
        let mut contexts = BTreeMap::new();
        contexts.insert(active.clone(), ConversationContext::new(active.clone()));
        Self { active, contexts }
    }

    pub fn active_key(&self) -> &ChannelKey {
        &self.active
    }

    /// The active context. `None` only for a restored snapshot that lacks it.
    pub fn active(&self) -> Option<&ConversationContext> {
        self.contexts.get(&self.active)
    }

    pub fn active_mut(&mut self) -> &mut ConversationContext {
        let key = self.active.clone();
        self.context_mut(&key)
    }

    pub fn context(&self, key: &ChannelKey) -> Option<&ConversationContext> {
        self.contexts.get(key)
    }

    /// The context for `key`, created on first reference.
    pub fn context_mut(&mut self, key: &ChannelKey) -> &mut ConversationContext {
        self.contexts
            .entry(key.clone())
            .or_insert_with(|| ConversationContext::new(key.clone()))
    }

    /// Make `key` the active context. Its unread counter drops to zero.
    ///
    /// Returns `false` if it already was active.
    pub fn set_active(&mut self, key: impl Into<ChannelKey>) -> bool {
        let key = key.into();
        let changed = key != self.active;
        self.context_mut(&key).mark_read();
        self.active = key;
        changed
    }

    /// Channels with unread events.
    pub fn unread(&self) -> BTreeMap<ChannelKey, u32> {
        self.contexts
            .values()
            .filter(|context| context.unread() > 0)
            .map(|context| (context.key().clone(), context.unread()))
            .collect()
    }

    pub fn reset(&mut self, key: &ChannelKey) {
        if let Some(context) = self.contexts.get_mut(key) {
            context.reset();
        }
    }

    pub fn replace_history(&mut self, key: &ChannelKey, events: Vec<Event>) {
        self.context_mut(key).replace_history(events);
    }

    /// Serialize every context for the snapshot store.
    pub fn snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Rebuild from [`snapshot`](Self::snapshot) output.
    pub fn restore(snapshot: &str) -> serde_json::Result<Self> {
        let mut conversations: Self = serde_json::from_str(snapshot)?;
        let active = conversations.active.clone();
        conversations.context_mut(&active);
        Ok(conversations)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.contexts.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(text: &str) -> Event {
        Event::text(EventKind::Assistant, text)
    }

    #[test]
    fn assistant_chunks_merge_until_finalized() {
        let mut context = ConversationContext::new("@leah".into());
        context.push_text(Event::text(EventKind::User, "hello"));
        context.push_text(assistant("Hi "));
        context.push_text(assistant("there"));
        assert_eq!(context.entries().len(), 2);
        assert_eq!(context.entries()[1].event.content(), Some("Hi there"));

        context.finalize();
        context.push_text(assistant("Next"));
        assert_eq!(context.entries().len(), 3);
    }

    #[test]
    fn echoed_submission_does_not_split_open_reply() {
        let mut context = ConversationContext::new("@leah".into());
        context.push_text(assistant("a"));
        context.push_text(Event::text(EventKind::User, "next question"));
        context.push_text(assistant("b"));
        assert_eq!(context.entries().len(), 2);
        assert_eq!(context.entries()[0].event.content(), Some("ab"));

        context.finalize();
        context.push_text(assistant("c"));
        assert_eq!(context.entries().len(), 3);
        assert_eq!(context.entries()[2].event.content(), Some("c"));
    }

    #[test]
    fn replies_from_different_senders_stay_apart() {
        let mut context = ConversationContext::new("#general".into());
        context.push_text(assistant("from leah ").with_sender("@leah"));
        context.push_text(assistant("from max").with_sender("@max"));
        context.push_text(assistant(" again").with_sender("@max"));

        let texts: Vec<_> = context.entries().iter().map(|e| e.event.content().unwrap()).collect();
        assert_eq!(texts, ["from leah ", "from max again"]);
        assert!(context.entries()[0].finalized);
        assert!(!context.entries()[1].finalized);
    }

    #[test]
    fn system_events_trail_last_non_system_entry() {
        let mut context = ConversationContext::new("#general".into());
        context.attach_system(Event::text(EventKind::System, "boot"));
        assert_eq!(context.entries().len(), 1);

        context.push_text(Event::text(EventKind::Message, "hi"));
        context.attach_system(Event::text(EventKind::System, "tool ran"));
        context.attach_system(Event::text(EventKind::System, "tool done"));

        assert_eq!(context.entries().len(), 2);
        assert_eq!(context.entries()[1].system_log.len(), 2);
    }

    #[test]
    fn system_does_not_close_streaming_reply() {
        let mut context = ConversationContext::new("@leah".into());
        context.push_text(assistant("one "));
        context.attach_system(Event::text(EventKind::System, "searching"));
        context.push_text(assistant("two"));
        assert_eq!(context.entries().len(), 1);
        assert_eq!(context.entries()[0].event.content(), Some("one two"));
    }

    #[test]
    fn replace_history_finalizes_entries() {
        let mut context = ConversationContext::new("@leah".into());
        context.push_text(assistant("stale"));
        context.replace_history(vec![assistant("old reply"), Event::text(EventKind::System, "note")]);
        assert_eq!(context.entries().len(), 1);
        assert!(context.entries()[0].finalized);
        assert_eq!(context.entries()[0].system_log.len(), 1);

        context.push_text(assistant("fresh"));
        assert_eq!(context.entries().len(), 2);
    }

    #[test]
    fn reset_clears_entries_and_conversation() {
        let mut context = ConversationContext::new("@leah".into());
        context.set_conversation_id("c1");
        context.push_text(assistant("x"));
        context.reset();
        assert!(context.entries().is_empty());
        assert_eq!(context.conversation_id(), None);
    }

    #[test]
    fn contexts_are_created_lazily_and_activation_clears_unread() {
        let mut conversations = Conversations::new("#general");
        assert!(conversations.context(&"#random".into()).is_none());

        conversations.context_mut(&"#random".into()).bump_unread();
        assert_eq!(conversations.unread().get(&ChannelKey::from("#random")), Some(&1));

        assert!(conversations.set_active("#random"));
        assert!(conversations.unread().is_empty());
        assert!(!conversations.set_active("#random"));
    }

    #[test]
    fn snapshot_restores_contexts_and_unread() {
        let mut conversations = Conversations::new("#general");
        conversations.active_mut().push_text(Event::text(EventKind::Message, "hi"));
        conversations.context_mut(&"@leah".into()).set_conversation_id("c9");
        conversations.context_mut(&"#random".into()).bump_unread();

        let restored = Conversations::restore(&conversations.snapshot().unwrap()).unwrap();

        assert_eq!(restored, conversations);
        assert_eq!(
            restored.context(&"@leah".into()).unwrap().conversation_id(),
            Some("c9")
        );
    }

    #[test]
    fn restore_recreates_missing_active_context() {
        let restored = Conversations::restore(r##"{"active":"#lost","contexts":{}}"##).unwrap();
        assert!(restored.active().is_some());
    }
}
