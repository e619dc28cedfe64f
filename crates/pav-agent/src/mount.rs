//! Bind mounts and device nodes for publishing staged volumes.
//!
//! The node agent runs privileged with the host's mount namespace
//! reachable, so these operations shell out to the host utilities
//! rather than reimplementing mount(2) plumbing.

use std::path::Path;
use std::process::Output;

use anyhow::{bail, Context as _, Result};
use tokio::process::Command;
use tracing::debug;

/// Bind-mounts a staged directory onto the publish target, creating the
/// target directory if needed.
pub async fn bind_mount_dir(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    tokio::fs::create_dir_all(target)
        .await
        .with_context(|| format!("creating mount target {}", target.display()))?;
    bind_mount(source, target, read_only).await
}

/// Bind-mounts a staged block device node onto the publish target,
/// creating the target file if needed. Raw block volumes are published
/// as a file, not a directory.
pub async fn bind_mount_device(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !target.exists() {
        tokio::fs::File::create(target)
            .await
            .with_context(|| format!("creating mount target {}", target.display()))?;
    }
    bind_mount(source, target, read_only).await
}

async fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    run("mount", &["--bind", &path_str(source)?, &path_str(target)?]).await?;
    if read_only {
        // A bind mount cannot be made read-only in one step.
        run(
            "mount",
            &["-o", "remount,bind,ro", &path_str(target)?],
        )
        .await?;
    }
    Ok(())
}

/// Unmounts the publish target. A target that is not mounted is fine;
/// unpublish must be idempotent.
pub async fn unmount(target: &Path) -> Result<()> {
    if !is_mount_point(target).await? {
        debug!(target = %target.display(), "not mounted, nothing to unmount");
        return Ok(());
    }
    run("umount", &[&path_str(target)?]).await?;
    Ok(())
}

/// Checks /proc/self/mounts for the given mount target.
pub async fn is_mount_point(target: &Path) -> Result<bool> {
    let mounts = tokio::fs::read_to_string("/proc/self/mounts")
        .await
        .context("reading /proc/self/mounts")?;
    let needle = path_str(target)?.replace(' ', "\\040");
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == needle))
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("path {} is not valid utf-8", path.display()))
}

async fn run(command: &str, args: &[&str]) -> Result<Output> {
    debug!(%command, ?args, "running host command");
    let output = Command::new(command)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {}", command))?;

    if !output.status.success() {
        bail!(
            "`{} {}` failed ({}): {}",
            command,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output)
}
