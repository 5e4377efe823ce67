//! CLI commands implementation

use anyhow::{Context, Result};
use cogs_core::rpc::{ReleaseArgs, METHOD_RELEASE};
use cogs_core::{ClaimStatus, NodeStatus};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::{debug, info};

use crate::client::ApiClient;

/// Print the node status
pub async fn status(client: &ApiClient) -> Result<()> {
    let body = client.get("/").await?;
    let status: NodeStatus =
        serde_json::from_slice(&body).context("malformed status from server")?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Claim devices, then print them or run `command` with them visible
pub async fn claim(
    client: &ApiClient,
    count: u32,
    timeout: f64,
    variable: &str,
    command: Vec<String>,
) -> Result<()> {
    let body = client.get(&wait_path(count, timeout)).await?;
    let granted: ClaimStatus =
        serde_json::from_slice(&body).context("malformed claim from server")?;
    let devices = device_list(&granted.numbers());

    let Some((program, args)) = command.split_first() else {
        println!("{}", devices);
        return Ok(());
    };

    info!(devices = %devices, program = %program, "Running with claimed devices");
    let err = Command::new(program).args(args).env(variable, &devices).exec();
    Err(err).with_context(|| format!("failed to run {}", program))
}

/// Release devices held by the caller
pub async fn release(client: &ApiClient, devices: Vec<u32>) -> Result<()> {
    let mut tunnel = client.tunnel().await?;
    let result = tunnel.call(METHOD_RELEASE, ReleaseArgs { devices }).await?;
    let released: ReleaseArgs =
        serde_json::from_value(result).context("malformed release reply from server")?;

    debug!(devices = ?released.devices, "Released");
    println!("{}", device_list(&released.devices));
    Ok(())
}

/// Path of a wait request
pub fn wait_path(count: u32, timeout: f64) -> String {
    format!("/wait?gpu={}&timeout={}", count, timeout)
}

/// Device numbers the way `CUDA_VISIBLE_DEVICES` expects them
pub fn device_list(numbers: &[u32]) -> String {
    numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_path() {
        assert_eq!(wait_path(2, 1.0), "/wait?gpu=2&timeout=1");
        assert_eq!(wait_path(1, 30.0), "/wait?gpu=1&timeout=30");
        assert_eq!(wait_path(1, -1.0), "/wait?gpu=1&timeout=-1");
        assert_eq!(wait_path(4, 0.5), "/wait?gpu=4&timeout=0.5");
    }

    #[test]
    fn test_device_list() {
        assert_eq!(device_list(&[]), "");
        assert_eq!(device_list(&[3]), "3");
        assert_eq!(device_list(&[0, 2, 5]), "0,2,5");
    }
}
