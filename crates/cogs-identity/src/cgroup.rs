//! Process inspection through the proc filesystem

use cogs_core::{CogsError, CogsResult};
use std::path::Path;
use tracing::trace;

/// Extract a Docker container ID from the contents of `/proc/<pid>/cgroup`
///
/// Recognizes the cgroup v1 `cpuset` hierarchy (`/docker/<id>`) and systemd
/// scopes (`.../docker-<id>.scope`) as used by cgroup v2.
pub fn container_from_cgroup(contents: &str) -> Option<String> {
    for line in contents.lines() {
        let mut tokens = line.trim().splitn(3, ':');
        let (Some(_), Some(controllers), Some(path)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };

        if controllers == "cpuset" {
            if let Some(rest) = path.strip_prefix("/docker/") {
                let id = rest.split('/').next().unwrap_or_default();
                if is_container_id(id) {
                    return Some(id.to_string());
                }
            }
        }

        let leaf = path.rsplit('/').next().unwrap_or_default();
        if let Some(id) = leaf
            .strip_prefix("docker-")
            .and_then(|rest| rest.strip_suffix(".scope"))
        {
            if is_container_id(id) {
                return Some(id.to_string());
            }
        }
    }

    None
}

fn is_container_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve the container a process runs in
pub async fn pid_to_container(proc_root: &Path, pid: u32) -> CogsResult<String> {
    let path = proc_root.join(pid.to_string()).join("cgroup");
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| CogsError::ProcessNotFound(pid))?;

    let container = container_from_cgroup(&contents).ok_or(CogsError::NotContainerized(pid))?;
    trace!(pid = pid, container = %container, "Resolved process container");
    Ok(container)
}

/// Read the command line of a process
pub async fn pid_to_command(proc_root: &Path, pid: u32) -> CogsResult<String> {
    let path = proc_root.join(pid.to_string()).join("cmdline");
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| CogsError::ProcessNotFound(pid))?;

    let command = String::from_utf8_lossy(&data).replace('\0', " ");
    Ok(command.trim_end().to_string())
}
