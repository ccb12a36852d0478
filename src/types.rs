//! Element types and the runtime value representation.
//!
//! The catalogue holds a closed set of built-in types (`bool`, the signed
//! and unsigned integers, `f32`/`f64`, and the zero-byte `void` used for
//! "indices only" tensors) plus user types carrying a byte size and an
//! opaque kernel-source fragment. Per-type behaviour is modelled with a sum
//! type over the built-ins and a boxed byte payload for user types.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Discriminant of a type record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElemKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Zero-byte type; tensors of `void` store structure only.
    Void,
    /// Opaque user type; values are raw byte payloads.
    User,
}

impl ElemKind {
    /// Whether tensors of this kind carry values (everything but `void`).
    #[inline]
    pub fn has_values(self) -> bool {
        !matches!(self, ElemKind::Void)
    }
}

/// An element type record: unique name, byte size, built-in flag, and an
/// opaque source fragment inlined into accelerator kernels.
#[derive(Debug)]
pub struct Type {
    name: String,
    kind: ElemKind,
    byte_size: usize,
    source: String,
}

impl Type {
    pub(crate) fn builtin(name: &str, kind: ElemKind, byte_size: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            byte_size,
            source: name.to_string(),
        })
    }

    pub(crate) fn user(name: String, byte_size: usize, source: String) -> Result<Arc<Self>> {
        if byte_size == 0 {
            return Err(Error::invalid_argument(
                "user type byte size must be positive (void is the only zero-byte type)",
            ));
        }
        Ok(Arc::new(Self {
            name,
            kind: ElemKind::User,
            byte_size,
            source,
        }))
    }

    /// Unique type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type discriminant.
    pub fn kind(&self) -> ElemKind {
        self.kind
    }

    /// Size of one value in bytes; zero only for `void`.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Whether the type is one of the predefined built-ins.
    pub fn is_builtin(&self) -> bool {
        self.kind != ElemKind::User
    }

    /// Whether tensors of this type carry values.
    pub fn has_values(&self) -> bool {
        self.kind.has_values()
    }

    /// Opaque source fragment for the accelerator compiler.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Type {
    /// Register a user type in `library`'s catalogue with no kernel source.
    pub fn make(name: &str, byte_size: usize, library: &crate::Library) -> Result<Arc<Self>> {
        library.types().register(name, byte_size, "")
    }

    /// Register a user type carrying a kernel-source fragment.
    pub fn make_with_source(
        name: &str,
        byte_size: usize,
        source: &str,
        library: &crate::Library,
    ) -> Result<Arc<Self>> {
        library.types().register(name, byte_size, source)
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Type {}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Runtime value of some element type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Void,
    User(Box<[u8]>),
}

impl Value {
    /// Kind of this value.
    pub fn kind(&self) -> ElemKind {
        match self {
            Value::Bool(_) => ElemKind::Bool,
            Value::Int8(_) => ElemKind::Int8,
            Value::Int16(_) => ElemKind::Int16,
            Value::Int32(_) => ElemKind::Int32,
            Value::Int64(_) => ElemKind::Int64,
            Value::UInt8(_) => ElemKind::UInt8,
            Value::UInt16(_) => ElemKind::UInt16,
            Value::UInt32(_) => ElemKind::UInt32,
            Value::UInt64(_) => ElemKind::UInt64,
            Value::Float32(_) => ElemKind::Float32,
            Value::Float64(_) => ElemKind::Float64,
            Value::Void => ElemKind::Void,
            Value::User(_) => ElemKind::User,
        }
    }

    /// Whether the value is zero (false for user payloads, true for void).
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Bool(v) => !*v,
            Value::Int8(v) => *v == 0,
            Value::Int16(v) => *v == 0,
            Value::Int32(v) => *v == 0,
            Value::Int64(v) => *v == 0,
            Value::UInt8(v) => *v == 0,
            Value::UInt16(v) => *v == 0,
            Value::UInt32(v) => *v == 0,
            Value::UInt64(v) => *v == 0,
            Value::Float32(v) => *v == 0.0,
            Value::Float64(v) => *v == 0.0,
            Value::Void => true,
            Value::User(_) => false,
        }
    }

    /// The zero value of `ty` (empty payload for user types).
    pub fn zero_of(ty: &Type) -> Value {
        match ty.kind() {
            ElemKind::Bool => Value::Bool(false),
            ElemKind::Int8 => Value::Int8(0),
            ElemKind::Int16 => Value::Int16(0),
            ElemKind::Int32 => Value::Int32(0),
            ElemKind::Int64 => Value::Int64(0),
            ElemKind::UInt8 => Value::UInt8(0),
            ElemKind::UInt16 => Value::UInt16(0),
            ElemKind::UInt32 => Value::UInt32(0),
            ElemKind::UInt64 => Value::UInt64(0),
            ElemKind::Float32 => Value::Float32(0.0),
            ElemKind::Float64 => Value::Float64(0.0),
            ElemKind::Void => Value::Void,
            ElemKind::User => Value::User(Box::default()),
        }
    }

    /// Check that this value can live in a tensor of `ty`.
    pub fn check_type(&self, ty: &Type) -> Result<()> {
        if self.kind() == ty.kind() {
            Ok(())
        } else {
            Err(Error::type_mismatch(format!(
                "value of kind {:?} cannot be stored as {}",
                self.kind(),
                ty.name()
            )))
        }
    }
}

macro_rules! value_from {
    ($($prim:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$prim> for Value {
                fn from(v: $prim) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// Names of the predefined built-ins, with their kinds and sizes.
const BUILTINS: &[(&str, ElemKind, usize)] = &[
    ("void", ElemKind::Void, 0),
    ("bool", ElemKind::Bool, 1),
    ("i8", ElemKind::Int8, 1),
    ("i16", ElemKind::Int16, 2),
    ("i32", ElemKind::Int32, 4),
    ("i64", ElemKind::Int64, 8),
    ("u8", ElemKind::UInt8, 1),
    ("u16", ElemKind::UInt16, 2),
    ("u32", ElemKind::UInt32, 4),
    ("u64", ElemKind::UInt64, 8),
    ("f32", ElemKind::Float32, 4),
    ("f64", ElemKind::Float64, 8),
];

/// Catalogue of element types owned by a library instance.
///
/// Seeded with the predefined types at construction; user types are
/// registered through [`TypeCatalogue::register`]. Lookups clone the shared
/// handle under the catalogue mutex.
pub struct TypeCatalogue {
    types: Mutex<HashMap<String, Arc<Type>>>,
}

impl TypeCatalogue {
    pub(crate) fn new() -> Self {
        let mut types = HashMap::new();
        for &(name, kind, size) in BUILTINS {
            types.insert(name.to_string(), Type::builtin(name, kind, size));
        }
        Self {
            types: Mutex::new(types),
        }
    }

    /// Find a registered type by name.
    pub fn find_type(&self, name: &str) -> Result<Arc<Type>> {
        self.types
            .lock()
            .expect("type catalogue mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_type(format!("no type named `{name}`")))
    }

    /// Register a user type with the given byte size and kernel fragment.
    pub fn register(&self, name: &str, byte_size: usize, source: &str) -> Result<Arc<Type>> {
        let ty = Type::user(name.to_string(), byte_size, source.to_string())?;
        let mut map = self.types.lock().expect("type catalogue mutex poisoned");
        if map.contains_key(name) {
            return Err(Error::invalid_argument(format!(
                "type `{name}` is already registered"
            )));
        }
        map.insert(name.to_string(), ty.clone());
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_seeded() {
        let cat = TypeCatalogue::new();
        for &(name, kind, size) in BUILTINS {
            let ty = cat.find_type(name).unwrap();
            assert_eq!(ty.kind(), kind);
            assert_eq!(ty.byte_size(), size);
            assert!(ty.is_builtin());
        }
    }

    #[test]
    fn unknown_type_lookup_fails() {
        let cat = TypeCatalogue::new();
        let err = cat.find_type("complex128").unwrap_err();
        assert_eq!(err.status(), crate::error::Status::UnknownType);
    }

    #[test]
    fn user_type_registration_round_trips() {
        let cat = TypeCatalogue::new();
        let ty = cat.register("pair64", 16, "typedef struct { long a, b; } pair64;").unwrap();
        assert!(!ty.is_builtin());
        assert_eq!(ty.byte_size(), 16);
        assert_eq!(cat.find_type("pair64").unwrap().name(), "pair64");
        // Duplicate registration is rejected.
        assert!(cat.register("pair64", 16, "").is_err());
    }

    #[test]
    fn zero_byte_user_type_is_rejected() {
        let cat = TypeCatalogue::new();
        assert!(cat.register("nothing", 0, "").is_err());
    }

    #[test]
    fn void_has_no_values() {
        let cat = TypeCatalogue::new();
        let void = cat.find_type("void").unwrap();
        assert!(!void.has_values());
        assert_eq!(void.byte_size(), 0);
        assert!(Value::Void.is_zero());
    }

    #[test]
    fn value_type_check() {
        let cat = TypeCatalogue::new();
        let i32t = cat.find_type("i32").unwrap();
        assert!(Value::Int32(5).check_type(&i32t).is_ok());
        assert!(Value::Float64(5.0).check_type(&i32t).is_err());
    }
}
