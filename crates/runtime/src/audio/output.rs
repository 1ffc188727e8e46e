//! Where decoded clips end up.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::PlaybackError;

/// An audio sink that plays one clip at a time.
pub trait AudioOutput: Send + 'static {
    /// Play `clip` to completion. Dropping the returned future must stop
    /// playback.
    fn play(&mut self, clip: Bytes) -> impl Future<Output = Result<(), PlaybackError>> + Send;

    /// Release whatever the output holds between clips.
    fn release(&mut self) {}
}

/// Plays clips by handing them to an external player process.
///
/// Each clip is spooled to a file and passed as the last argument of the
/// player command. The process is killed if playback is cancelled.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    program: String,
    args: Vec<String>,
    spool_dir: PathBuf,
}

impl CommandOutput {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            spool_dir: std::env::temp_dir(),
        }
    }

    /// Build from a full command line such as `["mpv", "--no-video"]`.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }
}

impl AudioOutput for CommandOutput {
    async fn play(&mut self, clip: Bytes) -> Result<(), PlaybackError> {
        let spool = SpoolFile::new(&self.spool_dir);
        tokio::fs::write(spool.path(), &clip)
            .await
            .map_err(|e| PlaybackError::Output(format!("spool {}: {e}", spool.path().display())))?;

        debug!(program = %self.program, clip = %spool.path().display(), "starting player");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(spool.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| PlaybackError::Output(format!("failed to run {}: {e}", self.program)))?;

        if !status.success() {
            return Err(PlaybackError::Output(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

/// A spooled clip, deleted when playback ends or is cancelled.
struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("parley-clip-{}", Uuid::new_v4())),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove spooled clip");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_program_and_args() {
        let line = vec!["mpv".to_string(), "--no-video".to_string()];
        let output = CommandOutput::from_command_line(&line).unwrap();
        assert_eq!(output.program, "mpv");
        assert_eq!(output.args, ["--no-video"]);
        assert!(CommandOutput::from_command_line(&[]).is_none());
    }

    #[tokio::test]
    async fn missing_player_is_an_output_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = CommandOutput::new("parley-no-such-player").spool_dir(dir.path());

        let err = output.play(Bytes::from_static(b"ID3")).await.unwrap_err();

        assert!(matches!(err, PlaybackError::Output(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn player_receives_spooled_clip() {
        let dir = tempfile::tempdir().unwrap();
        // `test -s FILE` succeeds only for a non-empty file.
        let mut output = CommandOutput::new("test")
            .args(["-s".to_string()])
            .spool_dir(dir.path());

        output.play(Bytes::from_static(b"ID3 clip")).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
