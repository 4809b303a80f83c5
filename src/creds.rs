// ABOUTME: Per-identity persisted authentication material, one file per identity under a base directory.
// ABOUTME: Loaded before login, rewritten after a successful fresh login, deleted when the platform revokes it.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// File-backed store for reusable login material keyed by identity.
///
/// Absence of an identity's file forces a fresh out-of-band login.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    basedir: PathBuf,
}

impl CredentialStore {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Returns the persisted material for `identity`, if any.
    pub fn load(&self, identity: &str) -> Option<String> {
        let material = fs::read_to_string(self.path(identity)).ok()?;
        let material = material.trim();
        if material.is_empty() {
            None
        } else {
            Some(material.to_string())
        }
    }

    /// Writes `material` for `identity`, creating the base directory if needed.
    pub fn save(&self, identity: &str, material: &str) -> Result<()> {
        fs::create_dir_all(&self.basedir).with_context(|| {
            format!(
                "failed to create credential directory {}",
                self.basedir.display()
            )
        })?;
        let path = self.path(identity);
        fs::write(&path, material)
            .with_context(|| format!("failed to write credentials to {}", path.display()))?;
        tracing::debug!(identity, "persisted login credentials");
        Ok(())
    }

    /// Removes the persisted material so the next run performs a fresh login.
    pub fn delete(&self, identity: &str) {
        if fs::remove_file(self.path(identity)).is_ok() {
            tracing::debug!(identity, "deleted stale login credentials");
        }
    }

    fn path(&self, identity: &str) -> PathBuf {
        self.basedir.join(format!("{identity}.login"))
    }
}
