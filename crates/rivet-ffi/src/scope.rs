//! Binding scopes.
//!
//! A [`BindingScope`] groups the state one module of bindings needs: the
//! libraries it resolves symbols from, a scope-local type registry that
//! shadows the process-wide one, and a cache of built invokers keyed by
//! name. Scopes are independent; custom type names registered in one never
//! leak into another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{FfiError, Result};
use crate::invoke::{CallConvention, Invoker};
use crate::library::DynamicLibrary;
use crate::parser::parse_declaration;
use crate::registry::TypeRegistry;
use crate::types::NativeType;

#[derive(Default)]
pub struct BindingScope {
    registry: TypeRegistry,
    libraries: RwLock<Vec<Arc<DynamicLibrary>>>,
    invokers: Mutex<HashMap<String, Arc<Invoker>>>,
}

impl BindingScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Add a library to the symbol search list. Attachment searches
    /// libraries in the order they were added.
    pub fn add_library(&self, library: Arc<DynamicLibrary>) {
        self.libraries.write().push(library);
    }

    /// Resolve `symbol` across the scope's libraries, first match wins.
    pub fn resolve(&self, symbol: &str) -> Result<*mut libc::c_void> {
        let libraries = self.libraries.read();
        if libraries.is_empty() {
            return Err(FfiError::SymbolNotFound {
                symbol: symbol.to_string(),
                library: "<no libraries in scope>".to_string(),
            });
        }
        let mut last = None;
        for library in libraries.iter() {
            match library.resolve(symbol) {
                Ok(addr) => return Ok(addr),
                Err(e) => last = Some(e),
            }
        }
        Err(last.expect("at least one library was searched"))
    }

    /// Bind `symbol` with an explicit signature and cache the invoker
    /// under `name`.
    pub fn attach(
        &self,
        name: &str,
        symbol: &str,
        args: Vec<NativeType>,
        ret: NativeType,
        convention: CallConvention,
        blocking: bool,
    ) -> Result<Arc<Invoker>> {
        let address = self.resolve(symbol)?;
        let invoker = Arc::new(Invoker::build(address, args, ret, convention, blocking)?);
        log::debug!("attached '{name}' ({symbol}) at {address:p}");
        self.invokers
            .lock()
            .insert(name.to_string(), invoker.clone());
        Ok(invoker)
    }

    /// Bind from a textual declaration, `name: (arg_types) -> ret`. Type
    /// names resolve through this scope's registry.
    pub fn attach_declaration(&self, decl: &str, blocking: bool) -> Result<Arc<Invoker>> {
        let parsed = parse_declaration(decl, &self.registry)?;
        self.attach(
            &parsed.name,
            &parsed.name,
            parsed.args,
            parsed.ret,
            CallConvention::Default,
            blocking,
        )
    }

    /// Look up a previously attached invoker.
    pub fn invoker(&self, name: &str) -> Option<Arc<Invoker>> {
        self.invokers.lock().get(name).cloned()
    }
}

impl std::fmt::Debug for BindingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingScope")
            .field("libraries", &self.libraries.read().len())
            .field("invokers", &self.invokers.lock().len())
            .finish()
    }
}
