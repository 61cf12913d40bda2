//! Turns a [`SymbolicRef`] into a [`ResolvedOperand`], caching the result on
//! the owning [`Insn`] the first time a call site executes (§4.6 "link-time
//! caching"). Every function here runs at most once per instruction per
//! class loader generation; `mod.rs`'s dispatch loop checks the cache first.

use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::loader::ClassLoaderHandle;
use crate::thread::ThreadHandle;
use crate::types::method::{Insn, ResolvedOperand, SymbolicRef};
use crate::types::{Method, Type, TypeName};
use crate::vm::Jvm;

/// Returns the cached operand, computing and storing it on first use.
pub fn cached(insn: &Insn, make: impl FnOnce() -> VmResult<ResolvedOperand>) -> VmResult<ResolvedOperand> {
    let mut slot = insn.resolved.lock();
    if matches!(&*slot, ResolvedOperand::None) {
        *slot = make()?;
    }
    Ok(slot.clone())
}

pub fn field(jvm: &Jvm, thread: &ThreadHandle, loader: &Arc<ClassLoaderHandle>, sym: &SymbolicRef) -> VmResult<ResolvedOperand> {
    let SymbolicRef::Field { owner, name, .. } = sym else {
        return Err(VmError::Internal("field opcode with non-field symbolic ref".into()));
    };
    let owner_ty = jvm.resolve_class(loader, owner, thread)?;
    let (decl_ty, idx) = owner_ty
        .find_field_inherited(name)
        .ok_or_else(|| VmError::NoSuchField { class: owner.clone(), name: name.clone() })?;
    let f = &decl_ty.fields[idx];
    let is_static = f.is_static();
    Ok(ResolvedOperand::Field {
        offset: if is_static { idx as i32 } else { f.offset },
        is_static,
        kind: f.value_kind(),
        owner: decl_ty,
    })
}

/// `invokestatic`/`invokespecial`: resolves straight to one fixed [`Method`],
/// no vtable/itable lookup involved.
pub fn direct_method(jvm: &Jvm, thread: &ThreadHandle, loader: &Arc<ClassLoaderHandle>, sym: &SymbolicRef) -> VmResult<ResolvedOperand> {
    let method = find_method(jvm, thread, loader, sym)?;
    Ok(ResolvedOperand::DirectMethod(method))
}

/// `invokevirtual`: resolves the static target to learn its vtable slot
/// (shared by every override, since a subtype's vtable is laid out to match
/// its supertype's); falls back to a direct call for methods that never go
/// through virtual dispatch (private/final-via-invokespecial-only methods
/// some compilers still emit behind `invokevirtual`).
pub fn virtual_method(jvm: &Jvm, thread: &ThreadHandle, loader: &Arc<ClassLoaderHandle>, sym: &SymbolicRef) -> VmResult<ResolvedOperand> {
    let method = find_method(jvm, thread, loader, sym)?;
    Ok(match method.vtable_index {
        Some(slot) => ResolvedOperand::VirtualSlot {
            slot,
            arg_words: method.param_word_count() + 1,
        },
        None => ResolvedOperand::DirectMethod(method),
    })
}

/// `invokeinterface`: only the name+descriptor are cached, since dispatch
/// always goes through the *receiver's* own interface method table — there
/// is no single "static target" to resolve ahead of time.
pub fn interface_method(sym: &SymbolicRef) -> VmResult<ResolvedOperand> {
    let SymbolicRef::Method { name, descriptor, .. } = sym else {
        return Err(VmError::Internal("invokeinterface with non-method symbolic ref".into()));
    };
    Ok(ResolvedOperand::InterfaceMethod {
        name: name.clone(),
        descriptor: descriptor.clone(),
    })
}

fn find_method(jvm: &Jvm, thread: &ThreadHandle, loader: &Arc<ClassLoaderHandle>, sym: &SymbolicRef) -> VmResult<Arc<Method>> {
    let SymbolicRef::Method { owner, name, descriptor, .. } = sym else {
        return Err(VmError::Internal("invoke opcode with non-method symbolic ref".into()));
    };
    let owner_ty = jvm.resolve_class(loader, owner, thread)?;
    owner_ty.find_method(name, descriptor).ok_or_else(|| VmError::NoSuchMethod {
        class: owner.clone(),
        name: name.clone(),
        descriptor: descriptor.clone(),
    })
}

pub fn class_name(sym: &SymbolicRef) -> VmResult<ResolvedOperand> {
    let SymbolicRef::Class(name) = sym else {
        return Err(VmError::Internal("class opcode with non-class symbolic ref".into()));
    };
    Ok(ResolvedOperand::Type(name.clone()))
}

/// Builds the one-dimensional array type name for `anewarray elem`.
/// `TypeName::array_of` just prefixes `[`, which is only correct when the
/// element name is already bracketed or primitive — a plain class name
/// (what `anewarray`'s constant pool entry actually names) needs wrapping
/// in `L...;` first, the same convention `loader::load_array_type` expects
/// when it strips an array name back down to its element.
pub fn array_type_name_for_element(elem: &Arc<Type>) -> TypeName {
    let elem_name = &elem.name;
    if elem_name.is_array() || elem.primitive_tag != crate::types::PrimitiveTag::NotPrimitive {
        TypeName::array_of(elem_name)
    } else {
        TypeName(format!("[L{};", elem_name.0))
    }
}
