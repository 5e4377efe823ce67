//! `nvidia-smi` backed telemetry source
//!
//! Inventory comes from a one-shot CSV query; metrics and process feeds are
//! long-running `dmon` / `pmon` children whose stdout is read line by line.

use async_trait::async_trait;
use cogs_core::{CogsError, CogsResult, Device, MonitorConfig};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::parse::parse_inventory;
use crate::traits::{Feed, FeedKind, TelemetrySource};

/// Telemetry source driving the `nvidia-smi` executable
pub struct SmiSource {
    config: MonitorConfig,
}

impl SmiSource {
    /// Create a new source
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Build the command for a feed
    fn build_command(&self, kind: FeedKind) -> Command {
        let mut cmd = Command::new(&self.config.smi_path);
        cmd.arg(kind.as_str());

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        cmd
    }
}

#[async_trait]
impl TelemetrySource for SmiSource {
    async fn enumerate(&self) -> CogsResult<Vec<Device>> {
        let output = Command::new(&self.config.smi_path)
            .arg("--query-gpu=index,uuid,name")
            .arg("--format=csv,noheader")
            .output()
            .await
            .map_err(|e| {
                CogsError::Infrastructure(format!(
                    "failed to run {}: {}",
                    self.config.smi_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(CogsError::Infrastructure(format!(
                "device query exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let devices = parse_inventory(&String::from_utf8_lossy(&output.stdout), &self.config)?;
        info!(count = devices.len(), "Enumerated devices");
        Ok(devices)
    }

    async fn open(&self, kind: FeedKind) -> CogsResult<Feed> {
        let mut cmd = self.build_command(kind);

        match cmd.spawn() {
            Ok(child) => {
                debug!(feed = %kind, pid = child.id().unwrap_or(0), "Telemetry feed spawned");
                Feed::from_child(kind, child)
            }
            Err(e) => {
                error!(feed = %kind, error = %e, "Failed to spawn telemetry feed");
                Err(CogsError::Infrastructure(format!(
                    "failed to spawn {} feed: {}",
                    kind, e
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn missing_tool() -> SmiSource {
        SmiSource::new(MonitorConfig {
            smi_path: PathBuf::from("/nonexistent/nvidia-smi"),
            ..MonitorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_missing_tool_fails_enumeration() {
        let source = missing_tool();
        assert!(matches!(
            source.enumerate().await,
            Err(CogsError::Infrastructure(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_fails_feed() {
        let source = missing_tool();
        assert!(matches!(
            source.open(FeedKind::Processes).await,
            Err(CogsError::Infrastructure(_))
        ));
        assert_eq!(source.name(), "nvidia-smi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_feed_reads_child_stdout() {
        // `echo dmon` stands in for the tool: one line, then exit.
        let source = SmiSource::new(MonitorConfig {
            smi_path: PathBuf::from("echo"),
            ..MonitorConfig::default()
        });

        let mut feed = source.open(FeedKind::Metrics).await.unwrap();
        assert_eq!(feed.next_line().await.unwrap().as_deref(), Some("dmon"));
        assert!(feed.next_line().await.unwrap().is_none());
        feed.finish().await;
    }
}
