use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// How a snapshot reached disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Plain overwrite of the target file.
    Direct,
    /// Written to a sibling temp file, then renamed over the target.
    TempRename,
}

/// Manager de almacenamiento para el snapshot JSON de la caché
#[derive(Debug, Clone)]
pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `contents`, trying a direct overwrite first and falling back
    /// to temp-file + rename.
    pub async fn write(&self, contents: &str) -> Result<WriteStrategy> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        match fs::write(&self.path, contents).await {
            Ok(()) => {
                debug!("💾 Snapshot escrito en {}", self.path.display());
                Ok(WriteStrategy::Direct)
            }
            Err(e) => {
                warn!(
                    "Direct write to {} failed ({}), retrying via temp file",
                    self.path.display(),
                    e
                );
                self.write_via_temp(contents).await?;
                Ok(WriteStrategy::TempRename)
            }
        }
    }

    async fn write_via_temp(&self, contents: &str) -> Result<()> {
        let path = self.path.clone();
        let contents = contents.to_owned();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                Some(dir) => dir.to_path_buf(),
                None => PathBuf::from("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("creating temp file in {}", dir.display()))?;
            tmp.write_all(contents.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("renaming temp file onto {}", path.display()))?;
            Ok(())
        })
        .await
        .context("snapshot writer task panicked")?
    }

    /// `Ok(None)` when the file does not exist.
    pub async fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let size_bytes = match fs::metadata(&self.path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("stat {}", self.path.display())),
        };
        Ok(StorageStats {
            path: self.path.clone(),
            size_bytes,
        })
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub path: PathBuf,
    pub size_bytes: Option<u64>,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.size_bytes {
            Some(size) => write!(
                f,
                "📁 Snapshot: {}\n📦 Size: {} bytes ({:.2} KB)",
                self.path.display(),
                size,
                size as f64 / 1024.0
            ),
            None => write!(f, "📁 Snapshot: {} (not written yet)", self.path.display()),
        }
    }
}
