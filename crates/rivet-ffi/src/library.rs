//! Native library loading and symbol resolution.

use std::collections::HashMap;
use std::path::Path;

use libloading::Library;
use parking_lot::Mutex;

use crate::error::{FfiError, Result};

/// dlopen-style options. `lazy` and `global` map to `RTLD_LAZY` and
/// `RTLD_GLOBAL` on Unix; Windows has no equivalents and ignores them.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub lazy: bool,
    pub global: bool,
}

/// An opened native library plus a cache of resolved symbol addresses.
///
/// Resolution is idempotent: racing lookups of the same symbol settle on
/// the same address, and the cache only ever grows.
pub struct DynamicLibrary {
    library: Library,
    /// Display name (path, or the process pseudo-name).
    name: String,
    symbols: Mutex<HashMap<String, usize>>,
}

impl DynamicLibrary {
    /// Open a shared library. A `None` path opens the current process's own
    /// symbol table, which is how libc-level symbols are reached without
    /// naming a library.
    pub fn open(path: Option<&Path>, flags: OpenFlags) -> Result<Self> {
        let name = match path {
            Some(p) => p.display().to_string(),
            None => "<this process>".to_string(),
        };
        let library = Self::open_inner(path, flags).map_err(|e| FfiError::Load {
            library: name.clone(),
            reason: e.to_string(),
        })?;
        log::debug!("opened library '{name}'");
        Ok(Self {
            library,
            name,
            symbols: Mutex::new(HashMap::new()),
        })
    }

    /// Open by base name, trying the platform-decorated filename in the
    /// current directory first and the system search path second.
    pub fn open_by_name(name: &str, flags: OpenFlags) -> Result<Self> {
        let file = Self::platform_library_name(name);
        Self::open(Some(Path::new(&file)), flags)
    }

    #[cfg(unix)]
    fn open_inner(path: Option<&Path>, flags: OpenFlags) -> std::result::Result<Library, libloading::Error> {
        use libloading::os::unix;
        let mut raw = if flags.lazy {
            libc::RTLD_LAZY
        } else {
            libc::RTLD_NOW
        };
        if flags.global {
            raw |= libc::RTLD_GLOBAL;
        }
        let lib = unsafe { unix::Library::open(path, raw) }?;
        Ok(lib.into())
    }

    #[cfg(windows)]
    fn open_inner(path: Option<&Path>, _flags: OpenFlags) -> std::result::Result<Library, libloading::Error> {
        use libloading::os::windows;
        let lib = match path {
            Some(p) => unsafe { windows::Library::new(p) }?,
            None => windows::Library::this()?,
        };
        Ok(lib.into())
    }

    /// The platform-specific filename for a library base name.
    pub fn platform_library_name(name: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            format!("{name}.dll")
        }
        #[cfg(target_os = "macos")]
        {
            format!("lib{name}.dylib")
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            format!("lib{name}.so")
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve an exported symbol to its address.
    ///
    /// Distinct from load failure: the library is already open here, so a
    /// miss means the symbol is absent, and callers may go on to try other
    /// candidate names.
    pub fn resolve(&self, symbol: &str) -> Result<*mut libc::c_void> {
        if let Some(&addr) = self.symbols.lock().get(symbol) {
            return Ok(addr as *mut libc::c_void);
        }
        let sym = unsafe { self.library.get::<*mut libc::c_void>(symbol.as_bytes()) }
            .map_err(|_| FfiError::SymbolNotFound {
                symbol: symbol.to_string(),
                library: self.name.clone(),
            })?;
        let addr = unsafe { sym.try_as_raw_ptr() }
            .filter(|p| !p.is_null())
            .ok_or_else(|| FfiError::SymbolNotFound {
                symbol: symbol.to_string(),
                library: self.name.clone(),
            })?;
        log::trace!("resolved '{symbol}' in '{}' to {addr:p}", self.name);
        self.symbols.lock().insert(symbol.to_string(), addr as usize);
        Ok(addr)
    }
}

impl std::fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name)
            .finish()
    }
}
