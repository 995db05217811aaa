//! Provider lock release
//!
//! A provider can switch between plugin versions from one run to the next,
//! which makes a stale dependency lock fail init. Locks are removed before a
//! runner is built.

use crate::types::Step;
use rigger_core::error::RiggerResult;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

pub const PROVIDER_LOCK_FILE: &str = ".terraform.lock.hcl";

/// Returns whether the file existed.
fn remove_if_exists(path: &Path) -> RiggerResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(lock = %path.display(), "Provider lock removed");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete the lock in the data dir, then the one next to the step module.
/// Only when the module lock was absent is the working dir lock deleted.
pub fn release_provider_lock(
    dhctl_dir: &Path,
    modules_dir: &Path,
    step: Step,
    working_dir: &Path,
) -> RiggerResult<()> {
    remove_if_exists(&dhctl_dir.join(PROVIDER_LOCK_FILE))?;

    let module_lock = modules_dir.join(step.as_str()).join(PROVIDER_LOCK_FILE);
    if remove_if_exists(&module_lock)? {
        return Ok(());
    }

    remove_if_exists(&working_dir.join(PROVIDER_LOCK_FILE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"# lock").unwrap();
    }

    #[test]
    fn test_module_lock_stops_release() {
        let root = tempfile::tempdir().unwrap();
        let dhctl = root.path().join("dhctl");
        let modules = root.path().join("modules");
        let working = root.path().join("layouts/standard/base-infrastructure");

        touch(&dhctl.join(PROVIDER_LOCK_FILE));
        touch(&modules.join("base-infrastructure").join(PROVIDER_LOCK_FILE));
        touch(&working.join(PROVIDER_LOCK_FILE));

        release_provider_lock(&dhctl, &modules, Step::BaseInfrastructure, &working).unwrap();

        assert!(!dhctl.join(PROVIDER_LOCK_FILE).exists());
        assert!(!modules.join("base-infrastructure").join(PROVIDER_LOCK_FILE).exists());
        assert!(working.join(PROVIDER_LOCK_FILE).exists());
    }

    #[test]
    fn test_missing_module_lock_releases_working_dir() {
        let root = tempfile::tempdir().unwrap();
        let working = root.path().join("w");
        touch(&working.join(PROVIDER_LOCK_FILE));

        release_provider_lock(
            &root.path().join("none"),
            &root.path().join("modules"),
            Step::MasterNode,
            &working,
        )
        .unwrap();

        assert!(!working.join(PROVIDER_LOCK_FILE).exists());
    }
}
