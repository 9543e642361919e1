//! Builds `.xpkg` archives from an extension's build output.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::archive::{compute_sha256, ASSETS_DIR, NATIVE_BINARIES, OPTIONAL_FILES, PORTABLE_BINARY};
use crate::error::{ExtensionError, Result};
use crate::manifest::{Manifest, MANIFEST_FILE};

/// Result of a successful [`PackageBuilder::build`].
#[derive(Debug, Clone)]
pub struct PackageReport {
    pub output: PathBuf,
    pub manifest: Manifest,
    /// SHA-256 hex digest of the written archive
    pub sha256: String,
    /// Entry names, in write order
    pub entries: Vec<String>,
}

/// Collects a manifest, binaries, optional documents and assets into an archive.
///
/// Relative paths are resolved against the input directory.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    input_dir: PathBuf,
    manifest: PathBuf,
    binary: PathBuf,
    portable: Option<PathBuf>,
}

impl PackageBuilder {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            manifest: PathBuf::from(MANIFEST_FILE),
            binary: PathBuf::from(NATIVE_BINARIES[0]),
            portable: None,
        }
    }

    pub fn manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest = path.into();
        self
    }

    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = path.into();
        self
    }

    pub fn portable(mut self, path: impl Into<PathBuf>) -> Self {
        self.portable = Some(path.into());
        self
    }

    /// Write the archive to `output`. A partially written file is removed on failure.
    pub fn build(&self, output: &Path) -> Result<PackageReport> {
        let manifest_path = self.input_dir.join(&self.manifest);
        let manifest_bytes = fs::read(&manifest_path).map_err(|e| {
            ExtensionError::Validation(format!(
                "cannot read manifest {}: {}",
                manifest_path.display(),
                e
            ))
        })?;
        let manifest = Manifest::from_slice(&manifest_bytes)?;

        let binary_path = self.input_dir.join(&self.binary);
        if !binary_path.is_file() {
            return Err(ExtensionError::Validation(format!(
                "extension binary not found: {}",
                binary_path.display()
            )));
        }
        let portable_path = match &self.portable {
            Some(path) => {
                let path = self.input_dir.join(path);
                if !path.is_file() {
                    return Err(ExtensionError::Validation(format!(
                        "portable binary not found: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let written = scopeguard::guard(output.to_path_buf(), |path| {
            let _ = fs::remove_file(path);
        });

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = zip::ZipWriter::new(File::create(output)?);
        let mut entries = Vec::new();

        zip.start_file(MANIFEST_FILE, options)?;
        zip.write_all(&manifest_bytes)?;
        entries.push(MANIFEST_FILE.to_string());

        let binary_name = native_entry_name(&binary_path);
        add_file(&mut zip, options, &binary_path, binary_name)?;
        entries.push(binary_name.to_string());

        if let Some(path) = portable_path {
            add_file(&mut zip, options, &path, PORTABLE_BINARY)?;
            entries.push(PORTABLE_BINARY.to_string());
        }

        for name in OPTIONAL_FILES {
            let path = self.input_dir.join(name);
            if path.is_file() {
                add_file(&mut zip, options, &path, name)?;
                entries.push(name.to_string());
            }
        }

        for (path, name) in collect_assets(&self.input_dir.join(ASSETS_DIR))? {
            add_file(&mut zip, options, &path, &name)?;
            entries.push(name);
        }

        zip.finish()?;
        let output = scopeguard::ScopeGuard::into_inner(written);
        let sha256 = compute_sha256(&output)?;

        tracing::info!(
            extension_id = %manifest.id,
            output = %output.display(),
            entries = entries.len(),
            "Extension packaged"
        );

        Ok(PackageReport {
            output,
            manifest,
            sha256,
            entries,
        })
    }
}

/// Archive name for a native binary, chosen by its file extension.
fn native_entry_name(binary: &Path) -> &'static str {
    match binary.extension().and_then(|e| e.to_str()) {
        Some("dylib") => NATIVE_BINARIES[1],
        Some("dll") => NATIVE_BINARIES[2],
        _ => NATIVE_BINARIES[0],
    }
}

fn add_file(
    zip: &mut zip::ZipWriter<File>,
    options: SimpleFileOptions,
    path: &Path,
    name: &str,
) -> Result<()> {
    zip.start_file(name, options)?;
    let mut file = File::open(path)?;
    std::io::copy(&mut file, zip)?;
    Ok(())
}

/// Files below `assets_dir` paired with their `assets/...` entry names, sorted.
fn collect_assets(assets_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    if !assets_dir.is_dir() {
        return Ok(files);
    }
    let mut pending = vec![assets_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(relative) = path.strip_prefix(assets_dir) else {
                continue;
            };
            let mut name = String::from(ASSETS_DIR);
            for part in relative.components() {
                name.push('/');
                name.push_str(&part.as_os_str().to_string_lossy());
            }
            files.push((path, name));
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
