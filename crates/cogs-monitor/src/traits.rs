//! Telemetry source trait definitions

use async_trait::async_trait;
use cogs_core::{CogsError, CogsResult, Device};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// The two line-oriented feeds a telemetry source provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Per-device metrics (`dmon`)
    Metrics,
    /// Per-device process attachment (`pmon`)
    Processes,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Metrics => "dmon",
            FeedKind::Processes => "pmon",
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of device inventory and live telemetry
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// List the attached devices
    async fn enumerate(&self) -> CogsResult<Vec<Device>>;

    /// Start a telemetry feed
    async fn open(&self, kind: FeedKind) -> CogsResult<Feed>;

    /// Get the source name
    fn name(&self) -> &'static str;
}

type LineReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// A stream of telemetry lines, optionally backed by a child process
pub struct Feed {
    kind: FeedKind,
    reader: LineReader,
    buf: Vec<u8>,
    child: Option<Child>,
    exhausted: bool,
}

impl Feed {
    /// Feed reading from an arbitrary byte stream
    pub fn from_reader(kind: FeedKind, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            kind,
            reader: BufReader::new(reader),
            buf: Vec::new(),
            child: None,
            exhausted: false,
        }
    }

    /// Feed reading the standard output of a spawned process
    ///
    /// The process must have been spawned with a piped stdout.
    pub fn from_child(kind: FeedKind, mut child: Child) -> CogsResult<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            CogsError::Infrastructure(format!("{} feed has no stdout pipe", kind))
        })?;

        let mut feed = Self::from_reader(kind, stdout);
        feed.child = Some(child);
        Ok(feed)
    }

    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Read the next line, `None` at end of stream
    ///
    /// Bytes that are not UTF-8 are replaced rather than failing the read;
    /// `pmon` cuts command names at a fixed width, mid-character included.
    pub async fn next_line(&mut self) -> CogsResult<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            self.exhausted = true;
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Reap the backing process and log how it ended
    pub async fn finish(mut self) {
        let Some(mut child) = self.child.take() else {
            debug!(feed = %self.kind, "Telemetry feed closed");
            return;
        };

        // Nobody drains the pipe any more, so the child could block forever.
        if !self.exhausted {
            if let Err(e) = child.start_kill() {
                debug!(feed = %self.kind, error = %e, "Failed to stop telemetry feed");
            }
        }

        match child.wait().await {
            Ok(status) => warn!(feed = %self.kind, status = %status, "Telemetry feed exited"),
            Err(e) => warn!(feed = %self.kind, error = %e, "Telemetry feed exited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_from_reader() {
        let mut feed = Feed::from_reader(FeedKind::Metrics, std::io::Cursor::new(b"a\nb\n".to_vec()));

        assert_eq!(feed.kind(), FeedKind::Metrics);
        assert_eq!(feed.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(feed.next_line().await.unwrap().as_deref(), Some("b"));
        assert!(feed.next_line().await.unwrap().is_none());
        feed.finish().await;
    }

    #[tokio::test]
    async fn test_feed_tolerates_invalid_utf8() {
        let text = b"0 111 C 1 1 - - python\n0 222 C 1 1 - - caf\xC3\n0 333 C 1 1 - - x\r\n".to_vec();
        let mut feed = Feed::from_reader(FeedKind::Processes, std::io::Cursor::new(text));

        assert_eq!(
            feed.next_line().await.unwrap().as_deref(),
            Some("0 111 C 1 1 - - python")
        );
        assert_eq!(
            feed.next_line().await.unwrap().as_deref(),
            Some("0 222 C 1 1 - - caf\u{FFFD}")
        );
        assert_eq!(
            feed.next_line().await.unwrap().as_deref(),
            Some("0 333 C 1 1 - - x")
        );
        assert!(feed.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_stops_undrained_child() {
        let child = tokio::process::Command::new("yes")
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut feed = Feed::from_child(FeedKind::Metrics, child).unwrap();
        assert_eq!(feed.next_line().await.unwrap().as_deref(), Some("y"));

        tokio::time::timeout(std::time::Duration::from_secs(5), feed.finish())
            .await
            .unwrap();
    }

    #[test]
    fn test_feed_kind_names() {
        assert_eq!(FeedKind::Metrics.to_string(), "dmon");
        assert_eq!(FeedKind::Processes.to_string(), "pmon");
    }
}
