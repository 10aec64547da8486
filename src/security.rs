#![forbid(unsafe_code)]

//! Process-level guards used by the tubeharvest binaries.

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Refuses to start a binary as root. Downloads and scratch files should
/// belong to a dedicated service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it under a dedicated service account");
    }
    Ok(())
}

/// Creates `path` (and parents) and restricts it to the owner. Scratch media
/// lives below this directory while a download is in flight.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    let metadata = fs::metadata(path).with_context(|| format!("inspecting {}", path.display()))?;
    if !metadata.is_dir() {
        bail!("{} exists but is not a directory", path.display());
    }
    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o777 != 0o700 {
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    Ok(())
}
