//! Export macros for extension crates.

/// Export the constructor and ABI symbols the native host looks for.
///
/// The extension crate must be built as a `cdylib`.
///
/// # Example
///
/// ```rust,ignore
/// use xpkg_sdk::prelude::*;
///
/// pub struct MyEmbedder {
///     core: ExtensionCore,
/// }
///
/// impl Default for MyEmbedder {
///     fn default() -> Self {
///         Self { core: ExtensionCore::from_json(include_str!("../manifest.json")).unwrap() }
///     }
/// }
///
/// // ... impl Extension + Embedder for MyEmbedder ...
///
/// export_extension!(MyEmbedder);
/// ```
///
/// A custom constructor expression can be given as a second argument:
/// `export_extension!(MyEmbedder, MyEmbedder::with_dimensions(768))`.
/// A panicking constructor makes the load fail instead of unwinding into the host.
#[macro_export]
macro_rules! export_extension {
    ($ty:ty) => {
        $crate::export_extension!($ty, <$ty as ::std::default::Default>::default());
    };
    ($ty:ty, $ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn xpkg_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[no_mangle]
        pub extern "C" fn xpkg_extension_create() -> *mut $crate::ExtensionBox {
            let created = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| -> $ty { $ctor }));
            match created {
                Ok(extension) => {
                    ::std::boxed::Box::into_raw(::std::boxed::Box::new($crate::ExtensionBox::new(extension)))
                }
                Err(_) => ::std::ptr::null_mut(),
            }
        }
    };
}
