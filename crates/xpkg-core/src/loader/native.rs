//! In-process host for native extension binaries (.so/.dylib/.dll).
//!
//! Only valid when the extension was built against the same `xpkg-core`
//! and compiler as the host: the constructor hands over a Rust trait object.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;

use super::{ExtensionHost, StagedPackage};
use crate::error::{ExtensionError, Result};
use crate::extension::Extension;
use crate::manifest::Manifest;

/// Version of the host/extension binary contract.
pub const ABI_VERSION: u32 = 1;

/// Exported by every extension: `extern "C" fn() -> u32`.
pub const ABI_VERSION_SYMBOL: &[u8] = b"xpkg_abi_version";

/// Exported by every extension: `extern "C" fn() -> *mut ExtensionBox`.
pub const CONSTRUCTOR_SYMBOL: &[u8] = b"xpkg_extension_create";

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub type ConstructorFn = unsafe extern "C" fn() -> *mut ExtensionBox;

/// Heap cell carrying an instance across the constructor boundary.
pub struct ExtensionBox(Arc<dyn Extension>);

impl ExtensionBox {
    pub fn new<E: Extension + 'static>(extension: E) -> Self {
        Self(Arc::new(extension))
    }

    pub fn into_inner(self) -> Arc<dyn Extension> {
        self.0
    }
}

/// Loads extension binaries into the current process.
///
/// Each binary is copied into `library_dir` under a unique name before it is
/// opened, so the extraction sandbox can be removed right away. Libraries are
/// never unloaded: instances created from them may outlive any registry entry.
pub struct NativeHost {
    library_dir: PathBuf,
    libraries: Mutex<Vec<Library>>,
}

impl NativeHost {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// Number of libraries opened so far.
    pub fn loaded_count(&self) -> usize {
        self.libraries.lock().len()
    }

    fn open(&self, manifest: &Manifest, binary: &Path) -> Result<Arc<dyn Extension>> {
        fs::create_dir_all(&self.library_dir)?;
        let suffix = binary
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("so");
        let target = self.library_dir.join(format!(
            "{}-{}.{}",
            manifest.id,
            uuid::Uuid::new_v4().simple(),
            suffix
        ));
        fs::copy(binary, &target)?;
        let copied = scopeguard::guard(target, |path| {
            let _ = fs::remove_file(path);
        });

        let library = unsafe { Library::new(copied.as_path()) }.map_err(|e| {
            ExtensionError::Load(format!(
                "cannot load extension binary {}: {}",
                binary.display(),
                e
            ))
        })?;

        let instance = {
            let abi: Symbol<AbiVersionFn> = unsafe { library.get(ABI_VERSION_SYMBOL) }
                .map_err(|e| {
                    ExtensionError::Load(format!(
                        "incompatible extension binary, symbol `xpkg_abi_version` missing: {}",
                        e
                    ))
                })?;
            let version = unsafe { abi() };
            if version != ABI_VERSION {
                return Err(ExtensionError::Load(format!(
                    "incompatible ABI version: host={}, extension={}",
                    ABI_VERSION, version
                )));
            }

            let create: Symbol<ConstructorFn> = unsafe { library.get(CONSTRUCTOR_SYMBOL) }
                .map_err(|e| {
                    ExtensionError::Load(format!(
                        "constructor symbol `xpkg_extension_create` not found: {}",
                        e
                    ))
                })?;
            let raw = unsafe { create() };
            if raw.is_null() {
                return Err(ExtensionError::Load(
                    "extension constructor returned null".to_string(),
                ));
            }
            unsafe { Box::from_raw(raw) }.into_inner()
        };

        let path = scopeguard::ScopeGuard::into_inner(copied);
        tracing::debug!(
            extension_id = %manifest.id,
            library = %path.display(),
            "Opened native extension library"
        );
        self.libraries.lock().push(library);
        Ok(instance)
    }
}

#[async_trait::async_trait]
impl ExtensionHost for NativeHost {
    fn kind(&self) -> &'static str {
        "native"
    }

    async fn instantiate(&self, package: &StagedPackage<'_>) -> Result<Arc<dyn Extension>> {
        self.open(package.manifest, &package.binary)
    }
}
