//! The stream session: one actor that owns all client state.
//!
//! Connection readers, submissions, history fetches and retry timers run as
//! spawned tasks that only ever send messages back to the actor. Everything
//! that mutates routing state happens inside [`StreamSession::run`], one
//! message at a time, so events are applied strictly in arrival order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use routing::{ChannelRouter, ConversationContext, Conversations, Outcome, RouteContext, RoutingPolicy};
use storage::SnapshotStore;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wire::{ChannelKey, Event, EventKind, decode_stream};

use crate::audio::{AudioPlaybackQueue, AudioTask, PlaybackEvent};
use crate::submission::{Submission, SubmissionQueue};
use crate::supervisor::{
    Attempt, ConnectionState, Directive, Disconnect, ReconnectPolicy, ReconnectSupervisor,
};
use crate::transport::{Credentials, PublishRequest, QueryRequest, Transport, TransportError};
use crate::{Error, Result};

const CONVERSATIONS_KEY: &str = "conversations";
const MUTED_KEY: &str = "muted";
const NOTIFICATION_CAPACITY: usize = 256;
const CHANNEL_REFRESH: Duration = Duration::from_secs(10);

/// Something the UI may want to redraw for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnectionChanged(ConnectionState),
    /// An event was routed.
    Routed(Outcome),
    ActiveChanged(ChannelKey),
    MutedChanged(bool),
    SubmissionStarted { id: Uuid, channel: ChannelKey },
    SubmissionFinished { id: Uuid, channel: ChannelKey },
    SubmissionFailed { id: Uuid, channel: ChannelKey, error: String },
    HistoryLoaded { channel: ChannelKey, count: usize },
    Reset(ChannelKey),
    /// The server's channel listing changed.
    ChannelsChanged(Vec<ChannelKey>),
    Playback(PlaybackEvent),
    /// Credentials were rejected; they have been cleared.
    SessionInvalid,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`StreamSession`].
pub struct SessionBuilder<T> {
    transport: Arc<T>,
    policy: RoutingPolicy,
    channel: ChannelKey,
    reconnect: ReconnectPolicy,
    credentials: Option<Credentials>,
    store: Option<Box<dyn SnapshotStore>>,
    audio: Option<AudioPlaybackQueue>,
    channel_refresh: Duration,
}

impl<T: Transport> SessionBuilder<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            policy: RoutingPolicy::default(),
            channel: ChannelKey::from("#general"),
            reconnect: ReconnectPolicy::default(),
            credentials: None,
            store: None,
            audio: None,
            channel_refresh: CHANNEL_REFRESH,
        }
    }

    pub fn policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Channel to open on when there is no snapshot.
    pub fn channel(mut self, channel: impl Into<ChannelKey>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn audio(mut self, audio: AudioPlaybackQueue) -> Self {
        self.audio = Some(audio);
        self
    }

    /// How often the server's channel listing is re-read. Defaults to 10s.
    pub fn channel_refresh(mut self, every: Duration) -> Self {
        self.channel_refresh = every;
        self
    }

    /// Restore the snapshot, if any, and start the session actor.
    pub fn spawn(self) -> Result<SessionHandle> {
        let mut conversations = None;
        let mut muted = false;
        if let Some(store) = &self.store {
            if let Some(raw) = store.get(CONVERSATIONS_KEY)? {
                match Conversations::restore(&raw) {
                    Ok(restored) => conversations = Some(restored),
                    Err(e) => {
                        warn!(error = %e, "discarding unreadable snapshot");
                        store.remove(CONVERSATIONS_KEY)?;
                    }
                }
            }
            muted = storage::load(store.as_ref(), MUTED_KEY)?.unwrap_or(false);
        }
        let conversations = conversations.unwrap_or_else(|| Conversations::new(self.channel));

        let username = self.credentials.as_ref().map(|c| c.username.clone());
        if let Some(credentials) = self.credentials {
            self.transport.set_credentials(Some(credentials));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        if let Some(audio) = &self.audio {
            tokio::spawn(forward_playback(audio.subscribe(), notifications.clone()));
        }

        info!(
            policy = %self.policy,
            active = %conversations.active_key(),
            muted,
            "starting session"
        );
        let session = StreamSession {
            transport: self.transport,
            router: ChannelRouter::new(self.policy),
            conversations,
            supervisor: ReconnectSupervisor::new(self.reconnect),
            submissions: SubmissionQueue::new(),
            audio: self.audio,
            store: self.store,
            muted,
            username,
            last_state: ConnectionState::Idle,
            listed: Vec::new(),
            channel_refresh: self.channel_refresh,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            notifications: notifications.clone(),
        };
        tokio::spawn(session.run());

        Ok(SessionHandle {
            commands: commands_tx,
            notifications,
        })
    }
}

async fn forward_playback(
    mut events: broadcast::Receiver<PlaybackEvent>,
    notifications: broadcast::Sender<Notification>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let _ = notifications.send(Notification::Playback(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "playback notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    ActiveContext(oneshot::Sender<ConversationContext>),
    SetActiveChannel(ChannelKey, oneshot::Sender<()>),
    Submit {
        text: String,
        context: Option<String>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    SetMuted(bool),
    EnsureConnected,
    AbortConnection,
    ResetActive(oneshot::Sender<()>),
    Reauthenticate(Credentials),
    Unread(oneshot::Sender<BTreeMap<ChannelKey, u32>>),
    ConnectionState(oneshot::Sender<ConnectionState>),
    Channels(oneshot::Sender<Vec<ChannelKey>>),
    AddChannelContext(String),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl SessionHandle {
    /// A copy of the context currently displayed.
    pub async fn active_context(&self) -> Result<ConversationContext> {
        self.ask(Command::ActiveContext).await
    }

    /// Switch the displayed channel. Its unread counter drops to zero and
    /// its server history is fetched in the background.
    pub async fn set_active_channel(&self, channel: impl Into<ChannelKey>) -> Result<()> {
        let channel = channel.into();
        self.ask(|reply| Command::SetActiveChannel(channel, reply)).await
    }

    /// Send `text` to the active channel. Returns the submission id; the
    /// request itself waits behind any submission still in flight.
    pub async fn submit(&self, text: impl Into<String>, context: Option<String>) -> Result<Uuid> {
        let text = text.into();
        self.ask(|reply| Command::Submit {
            text,
            context,
            reply,
        })
        .await?
    }

    /// Muting also drops whatever audio is queued.
    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.tell(Command::SetMuted(muted))
    }

    /// User-interaction signal: connect if nothing is connected or pending.
    pub fn ensure_connected(&self) -> Result<()> {
        self.tell(Command::EnsureConnected)
    }

    /// Drop the current connection. It is re-established after the retry
    /// delay.
    pub fn abort_connection(&self) -> Result<()> {
        self.tell(Command::AbortConnection)
    }

    /// Clear the active context here and on the server.
    pub async fn reset_active(&self) -> Result<()> {
        self.ask(Command::ResetActive).await
    }

    /// Resume after a [`Notification::SessionInvalid`].
    pub fn reauthenticate(&self, credentials: Credentials) -> Result<()> {
        self.tell(Command::Reauthenticate(credentials))
    }

    pub async fn unread(&self) -> Result<BTreeMap<ChannelKey, u32>> {
        self.ask(Command::Unread).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.ask(Command::ConnectionState).await
    }

    /// Channels the user can switch to: the server's latest listing, then
    /// any other channel that has local history.
    pub async fn channels(&self) -> Result<Vec<ChannelKey>> {
        self.ask(Command::Channels).await
    }

    /// Hand the server a note about the active channel for its personas to
    /// read. Nothing is shown locally.
    pub fn add_channel_context(&self, text: impl Into<String>) -> Result<()> {
        self.tell(Command::AddChannelContext(text.into()))
    }

    /// Tear down the connection, stop audio and save a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.ask(Command::Shutdown).await
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn tell(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    async fn ask<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tell(command(tx))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

/// Messages from the session's own background tasks.
enum Internal {
    Opened {
        generation: u64,
    },
    Pushed {
        generation: u64,
        event: Event,
    },
    Closed {
        generation: u64,
        reason: Disconnect,
    },
    RetryDue {
        generation: u64,
    },
    Reply {
        id: Uuid,
        event: Event,
    },
    SubmissionDone {
        id: Uuid,
        result: std::result::Result<(), TransportError>,
    },
    HistoryLoaded {
        channel: ChannelKey,
        result: std::result::Result<Option<Vec<Event>>, TransportError>,
    },
    ResetDone {
        channel: ChannelKey,
        result: std::result::Result<(), TransportError>,
    },
    ChannelsLoaded(std::result::Result<Vec<ChannelKey>, TransportError>),
    ChannelContextAdded {
        channel: ChannelKey,
        result: std::result::Result<(), TransportError>,
    },
}

/// Composes routing, connection supervision, submissions and audio.
///
/// Created through [`StreamSession::builder`] and driven through the
/// returned [`SessionHandle`].
pub struct StreamSession<T> {
    transport: Arc<T>,
    router: ChannelRouter,
    conversations: Conversations,
    supervisor: ReconnectSupervisor,
    submissions: SubmissionQueue,
    audio: Option<AudioPlaybackQueue>,
    store: Option<Box<dyn SnapshotStore>>,
    muted: bool,
    username: Option<String>,
    last_state: ConnectionState,
    /// Last channel listing from the server.
    listed: Vec<ChannelKey>,
    channel_refresh: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notifications: broadcast::Sender<Notification>,
}

impl<T: Transport> StreamSession<T> {
    pub fn builder(transport: Arc<T>) -> SessionBuilder<T> {
        SessionBuilder::new(transport)
    }

    async fn run(mut self) {
        let push = self.router.policy() == RoutingPolicy::Broadcast;
        let mut tick = tokio::time::interval(self.supervisor.policy().ensure_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.channel_refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let active = self.conversations.active_key().clone();
        self.fetch_history(active);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
                _ = tick.tick(), if push => self.ensure_connected(),
                _ = refresh.tick() => self.refresh_channels(),
            }
            self.sync_state();
        }
        debug!("session stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ActiveContext(reply) => {
                let _ = reply.send(self.conversations.active_mut().clone());
            }
            Command::SetActiveChannel(channel, reply) => {
                self.set_active_channel(channel);
                let _ = reply.send(());
            }
            Command::Submit {
                text,
                context,
                reply,
            } => {
                let _ = reply.send(self.submit(text, context));
            }
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::EnsureConnected => {
                if self.router.policy() == RoutingPolicy::Broadcast {
                    self.ensure_connected();
                }
            }
            Command::AbortConnection => {
                if !self.supervisor.abort() {
                    debug!(state = %self.supervisor.state(), "no live connection to abort");
                }
            }
            Command::ResetActive(reply) => {
                self.reset_active();
                let _ = reply.send(());
            }
            Command::Reauthenticate(credentials) => self.reauthenticate(credentials),
            Command::Unread(reply) => {
                let _ = reply.send(self.conversations.unread());
            }
            Command::ConnectionState(reply) => {
                let _ = reply.send(self.supervisor.state());
            }
            Command::Channels(reply) => {
                let mut channels = self.listed.clone();
                for channel in self.conversations.channels() {
                    if !channels.contains(channel) {
                        channels.push(channel.clone());
                    }
                }
                let _ = reply.send(channels);
            }
            Command::AddChannelContext(text) => self.add_channel_context(text),
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { generation } => {
                self.supervisor.on_open(generation);
            }
            Internal::Pushed { generation, event } => {
                if self.supervisor.is_current(generation) {
                    self.route(event);
                }
            }
            Internal::Closed { generation, reason } => {
                match self.supervisor.on_disconnect(generation, reason) {
                    Directive::Retry { generation, after } => {
                        let tx = self.internal_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(after).await;
                            let _ = tx.send(Internal::RetryDue { generation });
                        });
                    }
                    Directive::Halt => self.auth_failed(),
                    Directive::Ignore => {}
                }
            }
            Internal::RetryDue { generation } => {
                if let Some(attempt) = self.supervisor.retry_due(generation) {
                    self.connect(attempt);
                }
            }
            Internal::Reply { id, event } => {
                if self.submissions.in_flight().map(|s| s.id) != Some(id) {
                    debug!(%id, "dropping reply for finished submission");
                    return;
                }
                let end = event.kind == EventKind::End;
                self.route(event);
                if end {
                    self.finish_submission(id, Ok(()));
                }
            }
            Internal::SubmissionDone { id, result } => self.finish_submission(id, result),
            Internal::HistoryLoaded { channel, result } => match result {
                Ok(Some(events)) => {
                    let count = events.len();
                    self.conversations.replace_history(&channel, events);
                    self.persist();
                    self.notify(Notification::HistoryLoaded { channel, count });
                }
                Ok(None) => debug!(%channel, "server has no history"),
                Err(TransportError::Unauthorized) => self.auth_failed(),
                Err(e) => warn!(%channel, error = %e, "failed to load history"),
            },
            Internal::ResetDone { channel, result } => match result {
                Ok(()) => debug!(%channel, "server conversation reset"),
                Err(TransportError::Unauthorized) => self.auth_failed(),
                Err(e) => warn!(%channel, error = %e, "server reset failed"),
            },
            Internal::ChannelsLoaded(result) => match result {
                Ok(channels) => self.channels_loaded(channels),
                Err(TransportError::Unauthorized) => self.auth_failed(),
                Err(e) => debug!(error = %e, "failed to list channels"),
            },
            Internal::ChannelContextAdded { channel, result } => match result {
                Ok(()) => debug!(%channel, "channel context added"),
                Err(TransportError::Unauthorized) => self.auth_failed(),
                Err(e) => warn!(%channel, error = %e, "failed to add channel context"),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────────

    fn route(&mut self, event: Event) {
        let in_flight = self.submissions.in_flight().map(|s| s.channel.clone());
        let ctx = RouteContext {
            in_flight: in_flight.as_ref(),
            muted: self.muted,
        };
        let outcome = self.router.route(&mut self.conversations, event, ctx);

        match &outcome {
            Outcome::Audio(reference) => match &self.audio {
                Some(audio) => audio.enqueue(AudioTask::ready(reference.clone())),
                None => debug!(audio = %reference, "no audio output configured"),
            },
            Outcome::Ignored | Outcome::Muted(_) => {}
            _ => self.persist(),
        }
        self.notify(Notification::Routed(outcome));
    }

    fn set_active_channel(&mut self, channel: ChannelKey) {
        if self.conversations.set_active(channel.clone()) {
            info!(%channel, "switched channel");
        }
        self.persist();
        self.notify(Notification::ActiveChanged(channel.clone()));
        self.fetch_history(channel);
    }

    fn reset_active(&mut self) {
        let channel = self.conversations.active_key().clone();
        self.conversations.reset(&channel);
        self.persist();
        self.notify(Notification::Reset(channel.clone()));

        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.reset(&channel).await;
            let _ = tx.send(Internal::ResetDone { channel, result });
        });
    }

    fn fetch_history(&self, channel: ChannelKey) {
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.history(&channel).await;
            let _ = tx.send(Internal::HistoryLoaded { channel, result });
        });
    }

    fn refresh_channels(&self) {
        if self.supervisor.state() == ConnectionState::Failed {
            return;
        }
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.channels().await;
            let _ = tx.send(Internal::ChannelsLoaded(result));
        });
    }

    fn channels_loaded(&mut self, channels: Vec<ChannelKey>) {
        if channels != self.listed {
            debug!(count = channels.len(), "channel listing changed");
            self.listed = channels.clone();
            self.notify(Notification::ChannelsChanged(channels));
        }
        // An empty listing says nothing about the active channel.
        let active = self.conversations.active_key();
        if self.listed.is_empty() || self.listed.contains(active) {
            return;
        }
        let first = self.listed[0].clone();
        info!(%active, fallback = %first, "active channel no longer listed");
        self.set_active_channel(first);
    }

    fn add_channel_context(&self, text: String) {
        let channel = self.conversations.active_key().clone();
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.add_channel_context(&channel, &text).await;
            let _ = tx.send(Internal::ChannelContextAdded { channel, result });
        });
    }

    fn set_muted(&mut self, muted: bool) {
        if muted == self.muted {
            return;
        }
        self.muted = muted;
        if let Some(audio) = &self.audio {
            audio.clear();
        }
        self.persist();
        self.notify(Notification::MutedChanged(muted));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submissions
    // ─────────────────────────────────────────────────────────────────────────

    fn submit(&mut self, text: String, context: Option<String>) -> Result<Uuid> {
        if self.supervisor.state() == ConnectionState::Failed {
            return Err(Error::Auth);
        }
        let channel = self.conversations.active_key().clone();
        let submission = Submission::new(channel.clone(), text, context);
        let id = submission.id;

        // Echo right away; blank input shows as an ellipsis.
        let shown = if submission.text.trim().is_empty() {
            "..."
        } else {
            submission.text.as_str()
        };
        let mut echo = Event::text(EventKind::User, shown)
            .with_id(id.to_string())
            .with_channel(channel);
        echo.from_user = self.username.clone();
        self.conversations.active_mut().push_text(echo);
        self.persist();

        match self.submissions.submit(submission) {
            Some(start) => self.start_submission(start),
            None => debug!(%id, pending = self.submissions.pending_len(), "submission queued"),
        }
        Ok(id)
    }

    fn start_submission(&mut self, submission: Submission) {
        let id = submission.id;
        let channel = submission.channel.clone();
        debug!(%id, %channel, "starting submission");
        self.notify(Notification::SubmissionStarted {
            id,
            channel: channel.clone(),
        });

        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        match self.router.policy() {
            RoutingPolicy::Broadcast => {
                let request = PublishRequest {
                    query: submission.text,
                    channel,
                    context: submission.context,
                };
                tokio::spawn(async move {
                    let result = transport.publish(&request).await;
                    let _ = tx.send(Internal::SubmissionDone { id, result });
                });
            }
            RoutingPolicy::Conversation => {
                let conversation_id = self
                    .conversations
                    .context(&channel)
                    .and_then(ConversationContext::conversation_id)
                    .map(str::to_string);
                let request = QueryRequest {
                    query: submission.text,
                    persona: channel.persona().unwrap_or(channel.as_str()).to_string(),
                    context: submission.context,
                    conversation_id,
                };
                tokio::spawn(stream_reply(transport, id, request, tx));
            }
        }
    }

    fn finish_submission(&mut self, id: Uuid, result: std::result::Result<(), TransportError>) {
        let Some(channel) = self
            .submissions
            .in_flight()
            .filter(|s| s.id == id)
            .map(|s| s.channel.clone())
        else {
            return;
        };

        match result {
            Ok(()) => {
                debug!(%id, "submission complete");
                self.notify(Notification::SubmissionFinished { id, channel });
            }
            Err(TransportError::Unauthorized) => {
                self.notify(Notification::SubmissionFailed {
                    id,
                    channel,
                    error: TransportError::Unauthorized.to_string(),
                });
                self.auth_failed();
                return;
            }
            Err(e) => {
                warn!(%id, error = %e, "submission failed");
                self.notify(Notification::SubmissionFailed {
                    id,
                    channel,
                    error: e.to_string(),
                });
            }
        }

        if let Some(next) = self.submissions.complete(id) {
            self.start_submission(next);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────────

    fn ensure_connected(&mut self) {
        if let Some(attempt) = self.supervisor.ensure_connected() {
            self.connect(attempt);
        }
    }

    fn connect(&self, attempt: Attempt) {
        tokio::spawn(read_push_stream(
            self.transport.clone(),
            attempt,
            self.internal_tx.clone(),
        ));
    }

    fn reauthenticate(&mut self, credentials: Credentials) {
        info!(username = %credentials.username, "reauthenticated");
        self.username = Some(credentials.username.clone());
        self.transport.set_credentials(Some(credentials));
        self.supervisor.reauthenticate();
        if self.router.policy() == RoutingPolicy::Broadcast {
            self.ensure_connected();
        }
    }

    fn auth_failed(&mut self) {
        if self.supervisor.state() != ConnectionState::Failed {
            self.supervisor.fail_auth();
        }
        self.transport.set_credentials(None);
        let dropped = self.submissions.clear();
        if dropped > 0 {
            warn!(dropped, "discarding submissions after auth failure");
        }
        self.notify(Notification::SessionInvalid);
    }

    fn shutdown(&mut self) {
        info!("shutting down session");
        self.supervisor.teardown();
        if let Some(audio) = &self.audio {
            audio.clear();
        }
        self.persist();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────────────────────────────

    fn sync_state(&mut self) {
        let state = self.supervisor.state();
        if state != self.last_state {
            self.last_state = state;
            self.notify(Notification::ConnectionChanged(state));
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save_snapshot() {
            warn!(error = %e, "failed to save snapshot");
        }
    }

    fn save_snapshot(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.set(CONVERSATIONS_KEY, &self.conversations.snapshot()?)?;
        storage::save(store.as_ref(), MUTED_KEY, &self.muted)?;
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

fn disconnect_reason(error: TransportError) -> Disconnect {
    match error {
        TransportError::Unauthorized => Disconnect::Unauthorized,
        other => Disconnect::Network(other.to_string()),
    }
}

/// Read one push-stream connection until it ends, fails or is cancelled.
async fn read_push_stream<T: Transport>(
    transport: Arc<T>,
    attempt: Attempt,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let generation = attempt.generation;
    let opened = tokio::select! {
        _ = attempt.cancel.cancelled() => Err(Disconnect::Aborted),
        result = transport.subscribe() => result.map_err(disconnect_reason),
    };
    let bytes = match opened {
        Ok(bytes) => bytes,
        Err(reason) => {
            let _ = tx.send(Internal::Closed { generation, reason });
            return;
        }
    };
    let _ = tx.send(Internal::Opened { generation });

    let events = decode_stream(bytes);
    tokio::pin!(events);
    let reason = loop {
        tokio::select! {
            biased;
            _ = attempt.cancel.cancelled() => break Disconnect::Aborted,
            item = events.next() => match item {
                Some(Ok(event)) => {
                    if tx.send(Internal::Pushed { generation, event }).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break disconnect_reason(e),
                None => break Disconnect::Clean,
            },
        }
    };
    debug!(generation, ?reason, "stream closed");
    let _ = tx.send(Internal::Closed { generation, reason });
}

/// Run one `/query` request, forwarding reply events until `end`.
async fn stream_reply<T: Transport>(
    transport: Arc<T>,
    id: Uuid,
    request: QueryRequest,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let result = match transport.query(&request).await {
        Ok(bytes) => {
            let events = decode_stream(bytes);
            tokio::pin!(events);
            let mut result = Ok(());
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        let end = event.kind == EventKind::End;
                        if tx.send(Internal::Reply { id, event }).is_err() || end {
                            break;
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            result
        }
        Err(e) => Err(e),
    };
    let _ = tx.send(Internal::SubmissionDone { id, result });
}
