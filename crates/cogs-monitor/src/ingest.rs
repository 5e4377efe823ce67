//! Feed reader tasks turning telemetry lines into bus events

use cogs_core::{Claim, CogsResult, Device, EventBus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::parse::{parse_metrics_line, parse_process_line};
use crate::traits::{Feed, FeedKind, TelemetrySource};

/// Telemetry ingest pipeline
pub struct Monitor {
    source: Arc<dyn TelemetrySource>,
    bus: Arc<EventBus>,
}

impl Monitor {
    /// Create a new monitor publishing to `bus`
    pub fn new(source: Arc<dyn TelemetrySource>, bus: Arc<EventBus>) -> Self {
        Self { source, bus }
    }

    /// Enumerate the attached devices
    pub async fn enumerate(&self) -> CogsResult<Vec<Device>> {
        self.source.enumerate().await
    }

    /// Open both feeds and spawn one reader task per feed
    ///
    /// Each reader keeps its own copy of the inventory. Failing to open a
    /// feed is returned before any task is spawned.
    pub async fn start(&self, devices: &[Device]) -> CogsResult<Vec<JoinHandle<()>>> {
        let metrics = self.source.open(FeedKind::Metrics).await?;
        let processes = self.source.open(FeedKind::Processes).await?;

        info!(
            source = self.source.name(),
            devices = devices.len(),
            "Starting telemetry feeds"
        );

        let inventory: HashMap<u32, Device> =
            devices.iter().map(|d| (d.number, d.clone())).collect();
        let known: HashSet<u32> = devices.iter().map(|d| d.number).collect();

        Ok(vec![
            tokio::spawn(read_metrics(metrics, self.bus.clone(), inventory)),
            tokio::spawn(read_processes(processes, self.bus.clone(), known)),
        ])
    }
}

async fn read_metrics(mut feed: Feed, bus: Arc<EventBus>, mut inventory: HashMap<u32, Device>) {
    loop {
        let line = match feed.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(feed = %feed.kind(), error = %e, "Telemetry read failed");
                break;
            }
        };

        let sample = match parse_metrics_line(&line) {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(e) => {
                debug!(line = %line, error = %e, "Skipping metrics line");
                continue;
            }
        };

        let Some(device) = inventory.get_mut(&sample.number) else {
            trace!(number = sample.number, "Metrics for unknown device");
            continue;
        };

        sample.apply_to(device);
        bus.device_updated.publish(device.clone()).await;
    }

    feed.finish().await;
}

async fn read_processes(mut feed: Feed, bus: Arc<EventBus>, known: HashSet<u32>) {
    loop {
        let line = match feed.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(feed = %feed.kind(), error = %e, "Telemetry read failed");
                break;
            }
        };

        let claim: Claim = match parse_process_line(&line) {
            Ok(Some(claim)) => claim,
            Ok(None) => continue,
            Err(e) => {
                debug!(line = %line, error = %e, "Skipping process line");
                continue;
            }
        };

        if !known.contains(&claim.device_number) {
            trace!(number = claim.device_number, "Process on unknown device");
            continue;
        }

        bus.claim_observed.publish(claim).await;
    }

    feed.finish().await;
}
