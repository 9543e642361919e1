//! Turns an archive on disk into a live extension instance.
//!
//! ```text
//! archive.xpkg
//!     │  open_archive (private temp dir, removed on every exit path)
//!     ▼
//! manifest.json ──► host version ──► checksum (optional)
//!     │
//!     ▼
//! binary entry ──► ExtensionHost::instantiate ──► id check ──► LoadedExtension
//! ```
//!
//! How a staged package becomes an instance is the host's business: the
//! [`NativeHost`] opens the binary in-process, other hosts can proxy to a
//! separate process or service.

pub mod native;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use native::{ExtensionBox, NativeHost, ABI_VERSION};

use crate::archive::{self, BinaryEntry};
use crate::error::{ExtensionError, Result};
use crate::extension::Extension;
use crate::manifest::Manifest;

/// Version of this runtime, checked against manifest `min_version`/`max_version`.
pub fn runtime_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

/// An extracted, verified package ready to be instantiated.
pub struct StagedPackage<'a> {
    pub manifest: &'a Manifest,
    /// The original archive file
    pub archive_path: &'a Path,
    /// Extraction directory; gone once instantiation returns
    pub root: &'a Path,
    /// The native binary inside `root`
    pub binary: PathBuf,
}

/// Strategy for turning a staged package into an instance.
#[async_trait::async_trait]
pub trait ExtensionHost: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    async fn instantiate(&self, package: &StagedPackage<'_>) -> Result<Arc<dyn Extension>>;
}

/// A freshly loaded, not yet registered extension.
#[derive(Clone)]
pub struct LoadedExtension {
    pub instance: Arc<dyn Extension>,
    pub manifest: Arc<Manifest>,
}

impl LoadedExtension {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

/// Extracts archives and hands them to an [`ExtensionHost`].
pub struct ExtensionLoader {
    temp_dir: PathBuf,
    host: Arc<dyn ExtensionHost>,
    host_version: semver::Version,
}

impl ExtensionLoader {
    pub fn new(temp_dir: impl Into<PathBuf>, host: Arc<dyn ExtensionHost>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            host,
            host_version: runtime_version(),
        }
    }

    /// Override the version compared against manifest host ranges.
    pub fn with_host_version(mut self, version: semver::Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn host(&self) -> &Arc<dyn ExtensionHost> {
        &self.host
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Load one archive. Nothing is registered here.
    pub async fn load_extension(&self, archive_path: &Path) -> Result<LoadedExtension> {
        let source = archive_path.to_path_buf();
        let temp_root = self.temp_dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || archive::open_archive(&source, &temp_root))
                .await
                .map_err(|e| ExtensionError::Load(format!("extraction task failed: {}", e)))??;

        let manifest = extracted.manifest()?;
        manifest.check_host_compatibility(&self.host_version)?;

        if let Some(expected) = manifest.checksum.as_deref().filter(|c| !c.trim().is_empty()) {
            archive::verify_checksum(archive_path, expected)?;
        }

        let binary = match extracted.binary()? {
            BinaryEntry::Native(path) => path,
            BinaryEntry::Portable(_) => {
                return Err(ExtensionError::NotImplemented(format!(
                    "portable binary format for extension {}",
                    manifest.id
                )))
            }
        };

        let package = StagedPackage {
            manifest: &manifest,
            archive_path,
            root: extracted.path(),
            binary,
        };
        let instance = self.host.instantiate(&package).await?;

        let instance_id = instance.metadata().id.clone();
        if instance_id != manifest.id {
            if let Err(e) = instance.cleanup().await {
                tracing::debug!(extension_id = %instance_id, error = %e, "Cleanup of rejected instance failed");
            }
            return Err(ExtensionError::Mismatch {
                manifest: manifest.id.clone(),
                instance: instance_id,
            });
        }

        tracing::info!(
            extension_id = %manifest.id,
            version = %manifest.version,
            host = self.host.kind(),
            "Extension loaded"
        );

        Ok(LoadedExtension {
            instance,
            manifest: Arc::new(manifest),
        })
    }
}
