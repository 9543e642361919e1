//! `.xpkg` archive handling: sandboxed extraction, checksums and discovery.
//!
//! An archive is a ZIP container holding:
//!
//! ```text
//! manifest.json          required
//! plugin.so              primary native binary (plugin.dylib / plugin.dll accepted)
//! plugin.wasm            portable binary, reserved and not loadable yet
//! README.md              optional
//! LICENSE                optional
//! config.schema.json     optional standalone settings schema
//! assets/**              optional, relative paths preserved
//! ```

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ExtensionError, Result};
use crate::manifest::{ConfigSchema, Manifest, MANIFEST_FILE};

/// File extension of extension archives.
pub const ARCHIVE_EXTENSION: &str = "xpkg";

/// Accepted names for the primary native binary.
pub const NATIVE_BINARIES: [&str; 3] = ["plugin.so", "plugin.dylib", "plugin.dll"];

/// Reserved name of the portable binary.
pub const PORTABLE_BINARY: &str = "plugin.wasm";

pub const SCHEMA_FILE: &str = "config.schema.json";

/// Optional top-level documents copied into archives.
pub const OPTIONAL_FILES: [&str; 3] = ["README.md", "LICENSE", SCHEMA_FILE];

pub const ASSETS_DIR: &str = "assets";

/// Binary entry found in an extracted archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryEntry {
    Native(PathBuf),
    Portable(PathBuf),
}

/// An archive extracted into a private directory.
///
/// The directory and everything in it is removed when this value drops.
#[derive(Debug)]
pub struct ExtractedArchive {
    dir: tempfile::TempDir,
}

impl ExtractedArchive {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest(&self) -> Result<Manifest> {
        parse_manifest(self.path())
    }

    /// Locate the single binary entry.
    pub fn binary(&self) -> Result<BinaryEntry> {
        let mut natives: Vec<PathBuf> = NATIVE_BINARIES
            .iter()
            .map(|name| self.path().join(name))
            .filter(|p| p.is_file())
            .collect();

        if natives.len() > 1 {
            return Err(ExtensionError::Validation(format!(
                "archive contains {} native binaries, expected exactly one",
                natives.len()
            )));
        }
        if let Some(native) = natives.pop() {
            return Ok(BinaryEntry::Native(native));
        }

        let portable = self.path().join(PORTABLE_BINARY);
        if portable.is_file() {
            Ok(BinaryEntry::Portable(portable))
        } else {
            Err(ExtensionError::Load(format!(
                "extension binary not found ({} or {})",
                NATIVE_BINARIES[0], PORTABLE_BINARY
            )))
        }
    }
}

/// Parse `manifest.json` in `dir`, adopting `config.schema.json` when the
/// manifest carries no inline schema.
pub fn parse_manifest(dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::from_dir(dir)?;
    let schema_path = dir.join(SCHEMA_FILE);
    if manifest.config_schema.is_empty() && schema_path.is_file() {
        manifest.config_schema = parse_schema(&fs::read(&schema_path)?)?;
    }
    Ok(manifest)
}

/// Extract `archive_path` into a fresh directory under `temp_root`.
///
/// Every entry name is checked before anything is written; a single entry
/// resolving outside the destination fails the whole extraction.
pub fn open_archive(archive_path: &Path, temp_root: &Path) -> Result<ExtractedArchive> {
    fs::create_dir_all(temp_root)?;
    let dir = tempfile::Builder::new()
        .prefix("xpkg-")
        .tempdir_in(temp_root)?;

    let mut zip = zip::ZipArchive::new(File::open(archive_path)?)?;

    let mut plan = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let relative = sanitize_entry_name(entry.name()).ok_or_else(|| {
            ExtensionError::Validation(format!("invalid file path in archive: {}", entry.name()))
        })?;
        plan.push((index, relative, entry.is_dir()));
    }

    for (index, relative, is_dir) in plan {
        let target = dir.path().join(&relative);
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(index)?;
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    tracing::debug!(
        archive = %archive_path.display(),
        dir = %dir.path().display(),
        "Extracted extension archive"
    );
    Ok(ExtractedArchive { dir })
}

/// Read only the manifest (and standalone schema) straight from an archive.
pub fn read_manifest(archive_path: &Path) -> Result<Manifest> {
    let mut zip = zip::ZipArchive::new(File::open(archive_path)?)?;

    let mut bytes = Vec::new();
    match zip.by_name(MANIFEST_FILE) {
        Ok(mut entry) => {
            entry.read_to_end(&mut bytes)?;
        }
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ExtensionError::Validation(format!(
                "archive has no {}",
                MANIFEST_FILE
            )))
        }
        Err(e) => return Err(e.into()),
    }
    let mut manifest = Manifest::from_slice(&bytes)?;

    if manifest.config_schema.is_empty() {
        if let Ok(mut entry) = zip.by_name(SCHEMA_FILE) {
            let mut schema = Vec::new();
            entry.read_to_end(&mut schema)?;
            manifest.config_schema = parse_schema(&schema)?;
        }
    }
    Ok(manifest)
}

fn parse_schema(bytes: &[u8]) -> Result<ConfigSchema> {
    serde_json::from_slice(bytes)
        .map_err(|e| ExtensionError::Validation(format!("invalid {}: {}", SCHEMA_FILE, e)))
}

/// Map an archive entry name to a relative path inside the sandbox.
///
/// Returns `None` for absolute paths, drive prefixes, `..` components and
/// names that resolve to nothing.
pub fn sanitize_entry_name(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// SHA-256 hex digest of a file.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file's digest against `expected` (hex, case-insensitive).
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = compute_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ExtensionError::Integrity {
            expected: expected.to_string(),
            actual,
        })
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

/// Lazily walk `dir` (subdirectories included) yielding archive paths.
///
/// A missing directory yields nothing. Call again to restart.
pub fn discover(dir: impl Into<PathBuf>) -> Discover {
    Discover {
        pending: vec![dir.into()],
        current: None,
    }
}

/// Iterator returned by [`discover`].
#[derive(Debug)]
pub struct Discover {
    pending: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
}

impl Iterator for Discover {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            let Some(entries) = self.current.as_mut() else {
                let dir = self.pending.pop()?;
                match fs::read_dir(&dir) {
                    Ok(entries) => self.current = Some(entries),
                    Err(e) => {
                        tracing::debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    }
                }
                continue;
            };

            match entries.next() {
                Some(Ok(entry)) => {
                    let path = entry.path();
                    match entry.file_type() {
                        Ok(ft) if ft.is_dir() => self.pending.push(path),
                        Ok(ft) if ft.is_file() && is_archive(&path) => return Some(path),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to stat entry");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to read directory entry");
                }
                None => self.current = None,
            }
        }
    }
}
