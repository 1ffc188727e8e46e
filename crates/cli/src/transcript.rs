//! Incremental rendering of the active conversation to the terminal.

use std::fmt::Write;

use chrono::{Local, TimeZone};
use routing::{ConversationContext, Entry};
use wire::{Body, ChannelKey, Event, EventKind};

/// Remembers what has been printed so each render only emits what is new.
///
/// Streaming replies are printed once complete.
#[derive(Debug, Default)]
pub struct Transcript {
    channel: Option<ChannelKey>,
    shown: Vec<Shown>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Shown {
    entry: bool,
    system: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget what was printed; the next render starts over with a header.
    pub fn invalidate(&mut self) {
        self.channel = None;
        self.shown.clear();
    }

    /// Text to print for `context` since the last call.
    pub fn render(&mut self, context: &ConversationContext) -> String {
        let mut out = String::new();
        let entries = context.entries();
        if self.channel.as_ref() != Some(context.key()) || entries.len() < self.shown.len() {
            self.channel = Some(context.key().clone());
            self.shown.clear();
            let _ = writeln!(out, "── {} ──", context.key());
        }
        self.shown.resize(entries.len(), Shown::default());

        let persona = context.key().persona();
        for (entry, shown) in entries.iter().zip(self.shown.iter_mut()) {
            if !shown.entry && entry.finalized {
                let _ = writeln!(out, "{}", format_event(&entry.event, persona));
                shown.entry = true;
            }
            if shown.entry {
                write_system_log(&mut out, entry, shown.system);
                shown.system = entry.system_log.len();
            }
        }
        out
    }
}

fn write_system_log(out: &mut String, entry: &Entry, from: usize) {
    for event in entry.system_log.iter().skip(from) {
        let _ = writeln!(out, "    · {}", body_text(event));
    }
}

fn format_event(event: &Event, persona: Option<&str>) -> String {
    let time = Local
        .timestamp_opt(event.sent_at, 0)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let speaker = match event.kind {
        EventKind::System => return format!("[{time}] · {}", body_text(event)),
        EventKind::User => event.from_user.as_deref().unwrap_or("you"),
        EventKind::Assistant => persona.unwrap_or("assistant"),
        _ => event.from_user.as_deref().unwrap_or("?"),
    };
    format!("[{time}] {speaker}: {}", body_text(event))
}

fn body_text(event: &Event) -> String {
    match &event.body {
        Body::Text(text) => text.clone(),
        Body::Audio(reference) => format!("[audio {reference}]"),
        Body::Empty => String::new(),
    }
}
