//! Named type registries.
//!
//! A registry maps type names to [`NativeType`] descriptors. Binding scopes
//! carry a local registry that shadows the process-wide default for lookup
//! without ever mutating the global table; the global table carries the
//! primitive names and their C aliases.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{FfiError, Result};
use crate::types::NativeType;

static GLOBAL: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::with_primitives);

/// The process-wide default registry, pre-populated with primitive type
/// names. Read-mostly; additions are possible but scope-local registries
/// are the intended place for custom names.
pub fn global_registry() -> &'static TypeRegistry {
    &GLOBAL
}

pub struct TypeRegistry {
    types: RwLock<HashMap<String, NativeType>>,
}

impl TypeRegistry {
    /// An empty scope-local registry that falls back to the global one.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
        }
    }

    fn with_primitives() -> Self {
        let registry = Self::new();
        let entries: &[(&[&str], NativeType)] = &[
            (&["void"], NativeType::void()),
            (&["bool"], NativeType::bool()),
            (&["i8", "int8", "char", "schar"], NativeType::i8()),
            (&["u8", "uint8", "uchar"], NativeType::u8()),
            (&["i16", "int16", "short"], NativeType::i16()),
            (&["u16", "uint16", "ushort"], NativeType::u16()),
            (&["i32", "int32", "int"], NativeType::i32()),
            (&["u32", "uint32", "uint"], NativeType::u32()),
            (&["i64", "int64", "long_long"], NativeType::i64()),
            (&["u64", "uint64", "ulong_long", "size_t"], NativeType::u64()),
            (&["f32", "float"], NativeType::f32()),
            (&["f64", "double"], NativeType::f64()),
            (&["long_double"], NativeType::long_double()),
            (&["pointer", "ptr"], NativeType::pointer()),
            (&["string", "cstring"], NativeType::c_string()),
            (&["varargs", "..."], NativeType::varargs()),
        ];
        // `long` follows the platform data model: LLP64 on Windows, LP64
        // elsewhere.
        #[cfg(windows)]
        let (long, ulong) = (NativeType::i32(), NativeType::u32());
        #[cfg(not(windows))]
        let (long, ulong) = (NativeType::i64(), NativeType::u64());

        {
            let mut map = registry.types.write();
            for (names, ty) in entries {
                for name in *names {
                    map.insert((*name).to_string(), ty.clone());
                }
            }
            map.insert("long".to_string(), long);
            map.insert("ulong".to_string(), ulong);
        }
        registry
    }

    /// Register a descriptor under a name in this registry.
    pub fn register(&self, name: impl Into<String>, ty: NativeType) {
        self.types.write().insert(name.into(), ty);
    }

    /// Resolve a name, consulting this registry first and the process-wide
    /// default second.
    pub fn resolve(&self, name: &str) -> Result<NativeType> {
        if let Some(ty) = self.types.read().get(name) {
            return Ok(ty.clone());
        }
        if !std::ptr::eq(self, global_registry()) {
            if let Some(ty) = global_registry().types.read().get(name) {
                return Ok(ty.clone());
            }
        }
        Err(FfiError::UnknownType(name.to_string()))
    }

    /// Alias an existing name. The existing name is resolved now; later
    /// redefinition of the original does not rebind the alias (typedef
    /// semantics, not a live reference).
    pub fn typedef(&self, existing: &str, new_name: impl Into<String>) -> Result<()> {
        let resolved = self.resolve(existing)?;
        self.register(new_name, resolved);
        Ok(())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
