//! Strictly ordered audio playback.
//!
//! The event stream announces clips faster than they can be played. The
//! [`AudioPlaybackQueue`] keeps them in arrival order and plays one at a
//! time. Each clip is resolved, fetched and checked only when it reaches the
//! head of the queue; any failure along the way drops that clip and the next
//! one starts.

mod deferred;
mod output;

pub use deferred::{Deferred, Fulfill};
pub use output::{AudioOutput, CommandOutput};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wire::AudioRef;

/// Why a clip could not be played. Never fatal to the queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlaybackError {
    #[error("clip location was never supplied")]
    Unresolved,

    #[error("failed to fetch clip: {0}")]
    Fetch(String),

    #[error("clip is not playable audio: {0}")]
    Decode(String),

    #[error("audio output failed: {0}")]
    Output(String),
}

/// Fetches clip bytes for a resolved location.
pub trait ClipResolver: Send + Sync + 'static {
    fn fetch(&self, location: &str) -> impl Future<Output = Result<Bytes, PlaybackError>> + Send;
}

impl<R: ClipResolver> ClipResolver for Arc<R> {
    async fn fetch(&self, location: &str) -> Result<Bytes, PlaybackError> {
        self.as_ref().fetch(location).await
    }
}

/// One queued clip.
///
/// Clips announced on the stream name their own location, so the session
/// only builds [`ready`](Self::ready) tasks; the fetch still happens when
/// the clip reaches the head of the queue. [`deferred`](Self::deferred) is
/// for callers that learn the location after queueing.
#[derive(Debug)]
pub struct AudioTask {
    pub reference: AudioRef,
    pub location: Deferred<String>,
}

impl AudioTask {
    /// A clip whose location is the reference itself.
    pub fn ready(reference: AudioRef) -> Self {
        let location = Deferred::ready(reference.as_str().to_string());
        Self {
            reference,
            location,
        }
    }

    pub fn deferred(reference: AudioRef, location: Deferred<String>) -> Self {
        Self {
            reference,
            location,
        }
    }
}

/// Progress reports from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started(AudioRef),
    Finished(AudioRef),
    Failed(AudioRef, PlaybackError),
    Cleared { dropped: usize },
}

enum Command {
    Enqueue(AudioTask),
    Clear,
}

/// Handle to the playback task. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct AudioPlaybackQueue {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueue(task) => write!(f, "Enqueue({})", task.reference),
            Self::Clear => write!(f, "Clear"),
        }
    }
}

impl AudioPlaybackQueue {
    /// Start the playback task. It runs until every handle is dropped.
    pub fn spawn<R, O>(resolver: R, output: O) -> (Self, JoinHandle<()>)
    where
        R: ClipResolver,
        O: AudioOutput,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let player = Player {
            resolver,
            output,
            pending: VecDeque::new(),
            commands: rx,
            events: events.clone(),
        };
        let handle = tokio::spawn(player.run());
        (Self { commands, events }, handle)
    }

    /// Append a clip. Playback starts by itself if nothing is playing.
    pub fn enqueue(&self, task: AudioTask) {
        if self.commands.send(Command::Enqueue(task)).is_err() {
            warn!("playback task has stopped, dropping clip");
        }
    }

    /// Stop the current clip and discard everything pending.
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }
}

struct Player<R, O> {
    resolver: R,
    output: O,
    pending: VecDeque<AudioTask>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl<R: ClipResolver, O: AudioOutput> Player<R, O> {
    async fn run(mut self) {
        loop {
            let Some(task) = self.pending.pop_front() else {
                match self.commands.recv().await {
                    Some(Command::Enqueue(task)) => self.pending.push_back(task),
                    Some(Command::Clear) => self.clear(0),
                    None => break,
                }
                continue;
            };

            let reference = task.reference.clone();
            self.emit(PlaybackEvent::Started(reference.clone()));

            // Dropping `play` stops the output.
            let (result, stopped) = {
                let play = play_one(&self.resolver, &mut self.output, task);
                tokio::pin!(play);
                loop {
                    tokio::select! {
                        result = &mut play => break (Some(result), false),
                        command = self.commands.recv() => match command {
                            Some(Command::Enqueue(task)) => self.pending.push_back(task),
                            Some(Command::Clear) => break (None, true),
                            None => break (None, false),
                        },
                    }
                }
            };

            match result {
                Some(Ok(())) => {
                    debug!(clip = %reference, "clip finished");
                    self.emit(PlaybackEvent::Finished(reference));
                }
                Some(Err(e)) => {
                    warn!(clip = %reference, error = %e, "skipping clip");
                    self.emit(PlaybackEvent::Failed(reference, e));
                }
                None if stopped => self.clear(1),
                None => break,
            }
        }
        self.output.release();
        debug!("playback task stopped");
    }

    fn clear(&mut self, interrupted: usize) {
        let dropped = self.pending.len() + interrupted;
        self.pending.clear();
        self.output.release();
        info!(dropped, "audio queue cleared");
        self.emit(PlaybackEvent::Cleared { dropped });
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

async fn play_one<R: ClipResolver, O: AudioOutput>(
    resolver: &R,
    output: &mut O,
    task: AudioTask,
) -> Result<(), PlaybackError> {
    let location = task.location.resolve().await.ok_or(PlaybackError::Unresolved)?;
    let clip = resolver.fetch(&location).await?;
    check_playable(&clip)?;
    output.play(clip).await
}

/// Reject bodies that are obviously not audio, such as an HTML error page
/// served with a 200.
fn check_playable(clip: &[u8]) -> Result<(), PlaybackError> {
    const SIGNATURES: [&[u8]; 5] = [b"ID3", b"RIFF", b"OggS", b"fLaC", b"\x1aE\xdf\xa3"];

    if clip.is_empty() {
        return Err(PlaybackError::Decode("empty clip".into()));
    }
    // Bare MPEG audio frames start with an 11-bit sync word.
    let mpeg_sync = clip.len() >= 2 && clip[0] == 0xff && clip[1] & 0xe0 == 0xe0;
    if mpeg_sync || SIGNATURES.iter().any(|sig| clip.starts_with(sig)) {
        Ok(())
    } else {
        Err(PlaybackError::Decode("unrecognised audio container".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves clips from a map; unknown locations fail to fetch.
    struct MapResolver(HashMap<String, Bytes>);

    impl MapResolver {
        fn with(clips: &[&str]) -> Self {
            Self(
                clips
                    .iter()
                    .map(|name| (name.to_string(), Bytes::from(format!("ID3{name}"))))
                    .collect(),
            )
        }
    }

    impl ClipResolver for MapResolver {
        async fn fetch(&self, location: &str) -> Result<Bytes, PlaybackError> {
            self.0
                .get(location)
                .cloned()
                .ok_or_else(|| PlaybackError::Fetch(format!("404 {location}")))
        }
    }

    /// Records each clip and "plays" it for a fixed time.
    #[derive(Clone, Default)]
    struct RecordingOutput {
        played: Arc<Mutex<Vec<String>>>,
        length: Duration,
        releases: Arc<Mutex<usize>>,
    }

    impl AudioOutput for RecordingOutput {
        async fn play(&mut self, clip: Bytes) -> Result<(), PlaybackError> {
            let name = String::from_utf8_lossy(&clip[3..]).into_owned();
            self.played.lock().unwrap().push(name);
            tokio::time::sleep(self.length).await;
            Ok(())
        }

        fn release(&mut self) {
            *self.releases.lock().unwrap() += 1;
        }
    }

    fn task(name: &str) -> AudioTask {
        AudioTask::ready(AudioRef::new(name))
    }

    async fn next_settled(events: &mut broadcast::Receiver<PlaybackEvent>) -> PlaybackEvent {
        loop {
            match events.recv().await.unwrap() {
                PlaybackEvent::Started(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_clip_is_skipped_and_order_kept() {
        let output = RecordingOutput {
            length: Duration::from_millis(100),
            ..Default::default()
        };
        let played = output.played.clone();
        let (queue, _task) = AudioPlaybackQueue::spawn(MapResolver::with(&["b", "c"]), output);
        let mut events = queue.subscribe();

        queue.enqueue(task("a"));
        queue.enqueue(task("b"));
        queue.enqueue(task("c"));

        assert!(matches!(
            next_settled(&mut events).await,
            PlaybackEvent::Failed(r, PlaybackError::Fetch(_)) if r.as_str() == "a"
        ));
        assert_eq!(next_settled(&mut events).await, PlaybackEvent::Finished(AudioRef::new("b")));
        assert_eq!(next_settled(&mut events).await, PlaybackEvent::Finished(AudioRef::new("c")));
        assert_eq!(*played.lock().unwrap(), ["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clips_never_overlap() {
        let output = RecordingOutput {
            length: Duration::from_secs(1),
            ..Default::default()
        };
        let played = output.played.clone();
        let (queue, _task) = AudioPlaybackQueue::spawn(MapResolver::with(&["a", "b"]), output);
        let mut events = queue.subscribe();

        queue.enqueue(task("a"));
        queue.enqueue(task("b"));

        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Started(AudioRef::new("a")));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*played.lock().unwrap(), ["a"]);

        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Finished(AudioRef::new("a")));
        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Started(AudioRef::new("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_stops_current_and_drops_pending() {
        let output = RecordingOutput {
            length: Duration::from_secs(10),
            ..Default::default()
        };
        let played = output.played.clone();
        let releases = output.releases.clone();
        let (queue, _task) =
            AudioPlaybackQueue::spawn(MapResolver::with(&["a", "b", "c", "d"]), output);
        let mut events = queue.subscribe();

        queue.enqueue(task("a"));
        queue.enqueue(task("b"));
        queue.enqueue(task("c"));
        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Started(AudioRef::new("a")));

        queue.clear();
        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Cleared { dropped: 3 });
        assert_eq!(*releases.lock().unwrap(), 1);

        queue.enqueue(task("d"));
        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Started(AudioRef::new("d")));
        assert_eq!(*played.lock().unwrap(), ["a", "d"]);
    }

    #[tokio::test]
    async fn deferred_location_is_awaited_at_play_time() {
        let output = RecordingOutput::default();
        let played = output.played.clone();
        let (queue, _task) = AudioPlaybackQueue::spawn(MapResolver::with(&["late"]), output);
        let mut events = queue.subscribe();

        let (fulfill, location) = Deferred::channel();
        queue.enqueue(AudioTask::deferred(AudioRef::new("pending"), location));
        queue.enqueue(task("never-fetched-before-late"));
        assert_eq!(events.recv().await.unwrap(), PlaybackEvent::Started(AudioRef::new("pending")));

        fulfill.fulfill("late".to_string());
        assert_eq!(
            next_settled(&mut events).await,
            PlaybackEvent::Finished(AudioRef::new("pending"))
        );
        assert!(matches!(next_settled(&mut events).await, PlaybackEvent::Failed(..)));
        assert_eq!(*played.lock().unwrap(), ["late"]);
    }

    #[tokio::test]
    async fn abandoned_location_is_unresolved() {
        let (queue, _task) =
            AudioPlaybackQueue::spawn(MapResolver::with(&[]), RecordingOutput::default());
        let mut events = queue.subscribe();

        let (fulfill, location) = Deferred::channel();
        drop(fulfill);
        queue.enqueue(AudioTask::deferred(AudioRef::new("x"), location));

        assert_eq!(
            next_settled(&mut events).await,
            PlaybackEvent::Failed(AudioRef::new("x"), PlaybackError::Unresolved)
        );
    }

    #[test]
    fn playable_check() {
        assert!(check_playable(b"ID3\x04").is_ok());
        assert!(check_playable(&[0xff, 0xfb, 0x90]).is_ok());
        assert!(check_playable(b"OggS").is_ok());
        assert!(matches!(check_playable(b""), Err(PlaybackError::Decode(_))));
        assert!(matches!(
            check_playable(b"<html>oops</html>"),
            Err(PlaybackError::Decode(_))
        ));
    }
}
