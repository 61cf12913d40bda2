//! Method records, resolved bytecode (`MethodCode`/`Insn`), and the native
//! trampoline slot. Grounded on `vm/class/mod.rs`'s `MethodImplementation`/
//! `JavaMethodCode` shape, widened with the signature-hash bucket index
//! `SPEC_FULL.md` §4.2 uses for `invokeinterface` dispatch.

use std::sync::Arc;

use exo_class_file::item::ids::method::MethodDescriptor;
use exo_class_file::item::opcodes::VMOpcode;

use super::{AccessFlags, TypeName};
use crate::error::VmResult;
use crate::object::Value;
use crate::vm::Jvm;

pub type MethodId = u32;

#[derive(Debug, Clone)]
pub struct Method {
    pub declaring_class: TypeName,
    pub name: String,
    pub descriptor: String,
    pub parsed_descriptor: MethodDescriptor,
    pub access: AccessFlags,
    /// `None` for static/private/constructor methods, which never go through
    /// virtual dispatch.
    pub vtable_index: Option<u32>,
    /// FNV hash of `(name, descriptor)`, used to bucket this method in the
    /// declaring interface's method table (§4.2 "Interface-method tables").
    pub signature_hash: u64,
    pub code: MethodKind,
    pub declared_exceptions: Vec<TypeName>,
    /// The loader that defined `declaring_class`, i.e. the loader symbolic
    /// references inside this method's bytecode resolve against (JVMS
    /// §5.3's "defining loader" rule for a method's constant pool).
    pub defining_loader: std::sync::Weak<crate::loader::ClassLoaderHandle>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access & super::ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & super::ACC_ABSTRACT != 0
    }

    pub fn is_final(&self) -> bool {
        self.access & super::ACC_FINAL != 0
    }

    pub fn is_private(&self) -> bool {
        self.access & super::ACC_PRIVATE != 0
    }

    pub fn signature_hash_of(name: &str, descriptor: &str) -> u64 {
        use std::hash::Hasher;
        let mut h = fnv::FnvHasher::default();
        h.write(name.as_bytes());
        h.write(descriptor.as_bytes());
        h.finish()
    }

    pub fn param_word_count(&self) -> u32 {
        use exo_class_file::item::ids::field::{BaseType, FieldType};
        self.parsed_descriptor
            .parameters
            .iter()
            .map(|p| match p {
                FieldType::BaseType(BaseType::Long | BaseType::Double) => 2,
                _ => 1,
            })
            .sum()
    }
}

#[derive(Clone)]
pub enum MethodKind {
    Native(fn(&Jvm, &[Value]) -> VmResult<Option<Value>>),
    Java(Arc<MethodCode>),
    /// Declared but never given a body: interfaces, and `abstract` methods.
    Abstract,
}

impl std::fmt::Debug for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => write!(f, "Native(..)"),
            Self::Java(code) => f.debug_tuple("Java").field(code).finish(),
            Self::Abstract => write!(f, "Abstract"),
        }
    }
}

#[derive(Debug)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Insn>,
    pub exception_table: Vec<ExceptionTableEntry>,
    /// Per-instruction operand-stack depth on entry, computed once at link
    /// time by the static dataflow pass of §4.6; `interp` consults this
    /// instead of re-deriving it during dispatch.
    pub entry_depths: Vec<u16>,
    /// Bytecode byte offset of each instruction, indexed by position in
    /// `instructions`. Branch opcodes carry offsets relative to their own
    /// byte position (JVMS §4.9.1), so resolving a branch target to an
    /// `Insn` index needs this alongside its inverse, `byte_to_index`.
    pub insn_byte_offset: Vec<u32>,
    pub byte_to_index: fnv::FnvHashMap<u32, u32>,
    /// Constant-pool references decoded at derivation time (class names and
    /// field/method name+descriptor pairs, which need no loaded `Type` to
    /// read out of the classfile), keyed by instruction index. `interp`
    /// turns these into a [`ResolvedOperand`] the first time each
    /// instruction runs, since that step needs the referenced class loaded.
    pub symbolic_refs: fnv::FnvHashMap<u32, SymbolicRef>,
}

impl MethodCode {
    /// Resolves a branch's relative byte offset, taken from instruction
    /// `from`, to the `instructions` index it lands on.
    pub fn branch_target(&self, from: usize, relative_offset: i32) -> Option<u32> {
        let base = *self.insn_byte_offset.get(from)? as i64;
        let target_byte = base + relative_offset as i64;
        self.byte_to_index.get(&(target_byte as u32)).copied()
    }
}

/// `start_pc`/`end_pc`/`handler_pc` are `instructions` indices, not raw
/// bytecode byte offsets — converted once at derivation time so `interp`'s
/// hot path never needs the byte-offset tables again.
#[derive(Debug, Clone)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<TypeName>,
}

/// One resolved instruction. Carries the raw parsed opcode (still useful for
/// operand payloads `exo-class-file` already decoded) plus a lazily-filled
/// resolution cache, guarded by its own lock since the method's
/// instructions are shared (via the owning `MethodCode`'s `Arc`) across
/// every thread concurrently executing this method.
#[derive(Debug)]
pub struct Insn {
    pub opcode: VMOpcode,
    pub resolved: parking_lot::Mutex<ResolvedOperand>,
}

/// A field or method reference as named by the constant pool, decoded once
/// at class-derivation time. Needs no loaded `Type` to produce (it is pure
/// classfile bookkeeping), unlike [`ResolvedOperand`] which does.
#[derive(Debug, Clone)]
pub enum SymbolicRef {
    Field {
        owner: TypeName,
        name: String,
        descriptor: String,
    },
    Method {
        owner: TypeName,
        name: String,
        descriptor: String,
        interface: bool,
    },
    Class(TypeName),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
}

/// Resolution cache for an instruction's symbolic operand, written once the
/// first time the instruction executes (or eagerly at link time for
/// intra-class references). `None` is never reachable from the
/// interpreter's hot path twice for the same call site.
#[derive(Debug, Clone, Default)]
pub enum ResolvedOperand {
    #[default]
    None,
    Field {
        /// Declaring type, i.e. the one whose `static_values` map or instance
        /// layout `offset` is relative to — not necessarily the class named
        /// by the constant pool entry, since that may only inherit the field.
        owner: Arc<super::Type>,
        offset: i32,
        is_static: bool,
        kind: super::field::FieldValueKind,
    },
    /// Static/special/devirtualized calls resolve to one fixed target.
    DirectMethod(Arc<Method>),
    /// Virtual calls cache the vtable slot, re-read against the receiver's
    /// actual type on every dispatch; `arg_words` (receiver included) is
    /// fixed by the static method's descriptor, so it is cached alongside
    /// rather than re-derived from whichever override ends up running.
    VirtualSlot { slot: u32, arg_words: u32 },
    /// Interface calls cache the name+descriptor to skip the symbolic-ref
    /// lookup; the itable hash lookup itself still runs per dispatch since
    /// it is keyed on the receiver's own interface table.
    InterfaceMethod {
        name: String,
        descriptor: String,
    },
    Type(TypeName),
    BranchTarget(u32),
}
