//! Screenshot storage: binary payloads on the filesystem, metadata
//! everywhere else.
//!
//! Files land at `storage/screenshots/<audit_id>/<unix_ts>_<index>_<rand8>.png`.
//! Every path handed to or produced by this module is validated to resolve
//! under the screenshots root; traversal attempts are rejected outright.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::Rng;

use crate::state::ScreenshotMeta;

/// Filesystem store rooted at `storage/screenshots`.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
    max_bytes: u64,
}

impl ScreenshotStore {
    pub fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one capture and return its metadata. Rejects payloads over
    /// the size cap and audit ids that would escape the root.
    pub fn save(
        &self,
        audit_id: &str,
        index: u32,
        label: &str,
        bytes: &[u8],
    ) -> Result<ScreenshotMeta> {
        if bytes.len() as u64 > self.max_bytes {
            bail!(
                "screenshot of {} bytes exceeds the {} byte cap",
                bytes.len(),
                self.max_bytes
            );
        }

        let rand8: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let filename = format!("{}_{}_{}.png", chrono::Utc::now().timestamp(), index, rand8);

        let dir = self.root.join(audit_id);
        let path = dir.join(&filename);
        self.validate(&path)
            .with_context(|| format!("screenshot path rejected for audit {audit_id}"))?;

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create screenshot dir {}", dir.display()))?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write screenshot {}", path.display()))?;

        Ok(ScreenshotMeta {
            path: path.to_string_lossy().into_owned(),
            label: label.to_string(),
            index,
            size_bytes: bytes.len() as u64,
            mime: "image/png".to_string(),
        })
    }

    /// Check that a path stays inside the screenshots root without touching
    /// the filesystem (the file may not exist yet).
    pub fn validate(&self, path: &Path) -> Result<()> {
        // Lexical containment: no parent-dir hops, and the normalized path
        // must start with the normalized root.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            bail!("path {} contains parent traversal", path.display());
        }
        let normalized = normalize(path);
        let root = normalize(&self.root);
        if !normalized.starts_with(&root) {
            bail!(
                "path {} resolves outside screenshots root {}",
                path.display(),
                self.root.display()
            );
        }
        Ok(())
    }
}

/// Lexically normalize a path: drop `.` components. `..` is handled by the
/// caller's rejection above, so it never reaches here through `validate`.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
