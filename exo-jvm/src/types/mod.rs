//! Resolved type records: the output of derivation (§4.2), consumed by the
//! loader registry, interpreter, and GC alike.

pub mod field;
pub mod method;
pub mod tables;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use exo_class_file::item::ids::class::ClassName;

pub use field::{Field, FieldId, FieldLayout};
pub use method::{Insn, Method, MethodCode, MethodId};
pub use tables::{InstanceofTable, InterfaceMethodTable};

/// Internal-form type name (`com/exopteron/Foo`, `[Lcom/exopteron/Foo;`, `I`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeName(pub String);

impl TypeName {
    pub fn class(name: &ClassName) -> Self {
        let mut s = String::new();
        for pkg in &name.package {
            s.push_str(pkg);
            s.push('/');
        }
        s.push_str(&name.class_name);
        let mut cur = &name.inner_class;
        while let Some(inner) = cur {
            s.push('$');
            s.push_str(&inner.class_name);
            cur = &inner.inner_class;
        }
        Self(s)
    }

    pub fn array_of(element: &TypeName) -> Self {
        Self(format!("[{}", element.0))
    }

    pub fn is_array(&self) -> bool {
        self.0.starts_with('[')
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags::bitflags! {
    /// Per-type state bits, per the Data Model's `Type.flags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const ARRAY        = 1 << 0;
        const REFERENCE     = 1 << 1;
        const INTERFACE     = 1 << 2;
        const RESOLVED      = 1 << 3;
        const VERIFIED      = 1 << 4;
        const PREPARED      = 1 << 5;
        const INITIALIZED   = 1 << 6;
        const INIT_ERROR    = 1 << 7;
        const LOADED        = 1 << 8;
        const SKIPWORD      = 1 << 9;
        const SPECIAL       = 1 << 10;
        const FINALIZE      = 1 << 11;
    }
}

/// Java-visible access modifiers as read off the classfile, shared by
/// types/fields/methods.
pub type AccessFlags = u16;

pub const ACC_PUBLIC: AccessFlags = 0x0001;
pub const ACC_PRIVATE: AccessFlags = 0x0002;
pub const ACC_PROTECTED: AccessFlags = 0x0004;
pub const ACC_STATIC: AccessFlags = 0x0008;
pub const ACC_FINAL: AccessFlags = 0x0010;
pub const ACC_SUPER: AccessFlags = 0x0020;
pub const ACC_INTERFACE: AccessFlags = 0x0200;
pub const ACC_ABSTRACT: AccessFlags = 0x0400;

/// A primitive tag, packed into the lockword's 4-bit type tag for
/// non-reference types (object/read-modify-write dispatch need not consult
/// `Type` for these).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimitiveTag {
    NotPrimitive = 0,
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

/// A resolved class, interface, or array type.
///
/// Held behind `Arc` inside the owning [`crate::loader::ClassLoaderRegistry`];
/// types are reclaimed only when their defining loader is unloaded by the
/// collector (§4.9 "Class-loader unloading"), not by ordinary `Arc` drop —
/// the registry keeps one extra strong reference alive per type for exactly
/// that reason, released explicitly by `loader::unload`.
pub struct Type {
    pub name: TypeName,
    pub loader: Weak<crate::loader::ClassLoaderHandle>,
    pub superclass: Option<Arc<Type>>,
    pub interfaces: Vec<Arc<Type>>,
    pub access: AccessFlags,
    pub flags: AtomicU32,
    pub primitive_tag: PrimitiveTag,

    pub fields: Vec<Field>,
    pub layout: FieldLayout,
    pub static_values: parking_lot::Mutex<AHashMap<FieldId, crate::object::Value>>,

    pub methods: Vec<Arc<Method>>,
    pub vtable: Vec<Arc<Method>>,
    pub itable: InterfaceMethodTable,
    pub instanceof: InstanceofTable,

    /// Present only for array types: the element type.
    pub array_element: Option<Arc<Type>>,
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Type {
    pub fn flags(&self) -> TypeFlags {
        TypeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: TypeFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: TypeFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn has_flag(&self, flag: TypeFlags) -> bool {
        self.flags().contains(flag)
    }

    /// `isInstance` per the Data Model invariant: `x.type ∈ instanceof_table(T)`.
    pub fn is_instance_of(&self, other: &Type) -> bool {
        self.instanceof.contains(other)
    }

    /// Finds a declared or inherited method by name+descriptor, walking the
    /// superclass chain. Used for `invokespecial`/constructor resolution.
    pub fn find_method(self: &Arc<Self>, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut cur = Some(self.clone());
        while let Some(t) = cur {
            if let Some(m) = t
                .methods
                .iter()
                .find(|m| m.name == name && m.descriptor == descriptor)
            {
                return Some(m.clone());
            }
            cur = t.superclass.clone();
        }
        None
    }

    pub fn find_field(self: &Arc<Self>, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Like [`Self::find_field`] but walks the superclass chain, for
    /// `getfield`/`putfield`/`getstatic`/`putstatic` sites whose constant
    /// pool names a class that only inherits the field.
    pub fn find_field_inherited(self: &Arc<Self>, name: &str) -> Option<(Arc<Type>, usize)> {
        let mut cur = Some(self.clone());
        while let Some(t) = cur {
            if let Some(idx) = t.fields.iter().position(|f| f.name == name) {
                return Some((t.clone(), idx));
            }
            cur = t.superclass.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_name_builds_internal_form() {
        let cn = ClassName {
            package: vec!["com".into(), "exopteron".into()],
            class_name: "Foo".into(),
            inner_class: None,
        };
        assert_eq!(TypeName::class(&cn).0, "com/exopteron/Foo");
    }

    #[test]
    fn type_name_handles_inner_classes() {
        let cn = ClassName {
            package: vec!["com".into()],
            class_name: "Foo".into(),
            inner_class: Some(Box::new(ClassName {
                package: vec![],
                class_name: "Bar".into(),
                inner_class: None,
            })),
        };
        assert_eq!(TypeName::class(&cn).0, "com/Foo$Bar");
    }

    #[test]
    fn array_of_prefixes_bracket() {
        let elem = TypeName("java/lang/String".into());
        assert_eq!(TypeName::array_of(&elem).0, "[java/lang/String");
        assert!(TypeName::array_of(&elem).is_array());
    }

    #[test]
    fn flags_round_trip() {
        let flags = AtomicU32::new(0);
        let t_flags = TypeFlags::from_bits_truncate(flags.load(Ordering::Acquire));
        assert!(!t_flags.contains(TypeFlags::INITIALIZED));
    }
}
