use std::path::Path;

use nix::unistd::{Gid, Uid, User, chown};
use tracing::{debug, warn};

/// Uid/gid pair that produced artifacts are handed over to, so files
/// created under elevated privilege stay usable by the ordinary user.
#[derive(Debug, Clone)]
pub struct FileOwner {
    pub user: String,
    pub uid: Uid,
    pub gid: Gid,
}

/// Resolve the owner for produced artifacts.
///
/// The configured user wins; `SUDO_USER` is the fallback when the
/// configured name does not resolve. Returns None when neither resolves
/// (artifacts then stay owned by the current user).
pub fn resolve_owner(configured: &str) -> Option<FileOwner> {
    if let Some(owner) = owner_from_name(configured) {
        debug!(user = %owner.user, "Resolved artifact owner from configuration");
        return Some(owner);
    }

    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        if !sudo_user.is_empty() {
            if let Some(owner) = owner_from_name(&sudo_user) {
                debug!(user = %owner.user, "Resolved artifact owner from SUDO_USER");
                return Some(owner);
            }
        }
    }

    warn!(
        configured,
        "Could not resolve an artifact owner; files stay owned by the current user"
    );
    None
}

/// Hand a file over to `owner` (user and primary group).
pub fn chown_artifact(path: &Path, owner: &FileOwner) -> nix::Result<()> {
    chown(path, Some(owner.uid), Some(owner.gid))
}

fn owner_from_name(name: &str) -> Option<FileOwner> {
    let user = User::from_name(name).ok()??;
    Some(FileOwner {
        user: user.name,
        uid: user.uid,
        gid: user.gid,
    })
}
