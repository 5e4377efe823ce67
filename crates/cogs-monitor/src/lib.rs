//! cogs-monitor: Telemetry ingest
//!
//! This crate turns vendor monitoring output into bus events:
//! - `TelemetrySource` trait with an `nvidia-smi` implementation
//! - Parsers for inventory, metrics and process lines
//! - Reader tasks publishing `device_updated` / `claim_observed`

pub mod ingest;
pub mod parse;
pub mod smi;
pub mod traits;

pub use ingest::Monitor;
pub use smi::SmiSource;
pub use traits::{Feed, FeedKind, TelemetrySource};
