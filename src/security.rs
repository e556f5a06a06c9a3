//! Process and path guards used by the server.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path};

use crate::error::ServiceError;

/// Fails fast when the server is started as root. It writes whatever the
/// engine hands it into the downloads directory, so it should never do that
/// with elevated rights.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Accepts only a single plain file name. Runs before any filesystem access.
pub fn validate_filename(name: &str) -> Result<(), ServiceError> {
    if name.is_empty()
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ServiceError::InvalidFilename);
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ServiceError::InvalidFilename),
    }
}
