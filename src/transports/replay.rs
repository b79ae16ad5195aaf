//! Replay transport for recorded timing feeds

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::{Duration, Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::transport::{Transport, TransportConnection};
use crate::{KartwallError, Result};

/// Replays a recording with one feed frame per line
///
/// Blank lines are skipped. Every connect starts from the top of the file, so
/// a reconnect replays the whole session again.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    path: PathBuf,
    frame_interval: Duration,
}

impl ReplayTransport {
    /// Replay `path`, pacing frames `frame_interval` apart
    pub fn new(path: impl AsRef<Path>, frame_interval: Duration) -> Self {
        Self { path: path.as_ref().to_path_buf(), frame_interval }
    }

    /// Set playback speed relative to the recorded pacing
    pub fn with_speed(mut self, speed: f64) -> Self {
        let speed = speed.clamp(0.1, 100.0);
        self.frame_interval = self.frame_interval.div_f64(speed);
        debug!(speed, interval = ?self.frame_interval, "Replay speed set");
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl Transport for ReplayTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportConnection>> {
        let file = File::open(&self.path).await.map_err(|e| KartwallError::io_error(self.path.clone(), e))?;
        info!(path = %self.path.display(), url, "Replaying recorded feed");

        let pacing = match self.frame_interval.is_zero() {
            true => None,
            false => {
                let mut pacing = interval(self.frame_interval);
                pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(pacing)
            }
        };
        Ok(Box::new(ReplayConnection { lines: BufReader::new(file).lines(), pacing, frames: 0 }))
    }
}

/// Open replay of a recording
pub struct ReplayConnection {
    lines: Lines<BufReader<File>>,
    pacing: Option<Interval>,
    frames: u64,
}

#[async_trait::async_trait]
impl TransportConnection for ReplayConnection {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        // Pace before reading so a dropped call never loses a line.
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }
        loop {
            let line = self.lines.next_line().await.map_err(|e| KartwallError::transport_with_source("replay read failed", Box::new(e)))?;
            let Some(line) = line else {
                debug!(frames = self.frames, "Reached end of replay");
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            self.frames += 1;
            trace!(frame = self.frames, bytes = line.len(), "Replayed frame");
            return Ok(Some(line));
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        trace!(bytes = text.len(), "Replay ignores outbound frame");
        Ok(())
    }

    async fn close(&mut self) {}
}
