//! Optional privilege drop applied once listeners are bound.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[cfg(unix)]
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
    #[error("Privilege drop is not supported on this platform")]
    Unsupported,
}

/// A strategy for giving up privileges after startup.
pub trait PrivilegeDrop: Send + Sync {
    /// Apply the drop. Returns `false` when it was skipped (e.g. not root).
    fn apply(&self) -> Result<bool, PrivilegeError>;

    fn describe(&self) -> String;
}

/// Change root to `root`, then switch to `user`.
#[derive(Debug, Clone)]
pub struct Chroot {
    pub root: PathBuf,
    pub user: String,
}

impl Chroot {
    /// Build from the optional `--chroot`/`--chuser` pair; both are required.
    pub fn from_options(root: Option<&PathBuf>, user: Option<&str>) -> Option<Self> {
        match (root, user) {
            (Some(root), Some(user)) => Some(Self {
                root: root.clone(),
                user: user.to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(unix)]
impl PrivilegeDrop for Chroot {
    fn apply(&self) -> Result<bool, PrivilegeError> {
        use nix::unistd::{chdir, chroot, setgid, setuid, Uid, User};

        if !Uid::current().is_root() {
            return Ok(false);
        }
        // Resolve the user before the passwd database disappears.
        let user = User::from_name(&self.user)?
            .ok_or_else(|| PrivilegeError::UnknownUser(self.user.clone()))?;
        chroot(&self.root)?;
        chdir("/")?;
        setgid(user.gid)?;
        setuid(user.uid)?;
        Ok(true)
    }

    fn describe(&self) -> String {
        format!(
            "Changed root to \"{}\" and user to \"{}\"",
            self.root.display(),
            self.user
        )
    }
}

#[cfg(not(unix))]
impl PrivilegeDrop for Chroot {
    fn apply(&self) -> Result<bool, PrivilegeError> {
        Err(PrivilegeError::Unsupported)
    }

    fn describe(&self) -> String {
        format!("chroot to {} (unsupported)", self.root.display())
    }
}
