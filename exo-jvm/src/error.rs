//! Error taxonomy for the runtime core.
//!
//! Mirrors the `java/lang/*Error`/`java/lang/*Exception` names used at the
//! JNI/reflection boundary. A thrown Java object is carried verbatim in
//! [`VmError::Thrown`]; everything else is a core-internal condition that
//! gets wrapped into the matching Java exception class by the caller that
//! first observes it crossing into Java-visible territory.

use thiserror::Error;

use crate::types::TypeName;

pub type VmResult<T> = std::result::Result<T, VmError>;

/// Every error the runtime core can produce, per `SPEC_FULL.md` §7.
#[derive(Debug, Error)]
pub enum VmError {
    // --- linkage errors -------------------------------------------------
    #[error("no class def found: {0}")]
    NoClassDefFound(TypeName),

    #[error("linkage error: {0}")]
    Linkage(String),

    #[error("incompatible class change: {0}")]
    IncompatibleClassChange(String),

    #[error("no such field: {class}.{name}")]
    NoSuchField { class: TypeName, name: String },

    #[error("no such method: {class}.{name}{descriptor}")]
    NoSuchMethod {
        class: TypeName,
        name: String,
        descriptor: String,
    },

    #[error("class circularity: {0} required its own derivation")]
    ClassCircularity(TypeName),

    #[error("class format error: {0}")]
    ClassFormat(String),

    #[error("unsupported class version: {major}.{minor}")]
    UnsupportedClassVersion { major: u16, minor: u16 },

    #[error("verify error: {0}")]
    Verify(String),

    #[error("abstract method error: {class}.{name}{descriptor}")]
    AbstractMethod {
        class: TypeName,
        name: String,
        descriptor: String,
    },

    #[error("illegal access: {0}")]
    IllegalAccess(String),

    // --- initialization errors ------------------------------------------
    #[error("exception in initializer of {class}: {cause}")]
    ExceptionInInitializer { class: TypeName, cause: String },

    // --- runtime exceptions ----------------------------------------------
    #[error("null pointer")]
    NullPointer,

    #[error("arithmetic exception: {0}")]
    Arithmetic(&'static str),

    #[error("array index out of bounds: index {index}, length {length}")]
    ArrayIndexOutOfBounds { index: i32, length: i32 },

    #[error("array store: cannot store {value} into {array}")]
    ArrayStore { array: TypeName, value: TypeName },

    #[error("class cast: {from} cannot be cast to {to}")]
    ClassCast { from: TypeName, to: TypeName },

    #[error("negative array size: {0}")]
    NegativeArraySize(i32),

    #[error("stack overflow")]
    StackOverflow,

    // --- resource exhaustion ----------------------------------------------
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    // --- monitor misuse ----------------------------------------------------
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(&'static str),

    // --- a live Java exception object propagating through the core -------
    #[error("java exception thrown")]
    Thrown(crate::object::ObjectRef),

    // --- thread-level cancellation ------------------------------------------
    #[error("interrupted")]
    Interrupted,
}

impl VmError {
    /// Internal-form name of the `java.lang` exception/error class this
    /// condition maps to at the JNI boundary, where applicable.
    pub fn java_class_name(&self) -> Option<&'static str> {
        use VmError::*;
        Some(match self {
            NoClassDefFound(_) => "java/lang/NoClassDefFoundError",
            Linkage(_) => "java/lang/LinkageError",
            IncompatibleClassChange(_) => "java/lang/IncompatibleClassChangeError",
            NoSuchField { .. } => "java/lang/NoSuchFieldError",
            NoSuchMethod { .. } => "java/lang/NoSuchMethodError",
            ClassCircularity(_) => "java/lang/ClassCircularityError",
            ClassFormat(_) => "java/lang/ClassFormatError",
            UnsupportedClassVersion { .. } => "java/lang/UnsupportedClassVersionError",
            Verify(_) => "java/lang/VerifyError",
            AbstractMethod { .. } => "java/lang/AbstractMethodError",
            IllegalAccess(_) => "java/lang/IllegalAccessError",
            ExceptionInInitializer { .. } => "java/lang/ExceptionInInitializerError",
            NullPointer => "java/lang/NullPointerException",
            Arithmetic(_) => "java/lang/ArithmeticException",
            ArrayIndexOutOfBounds { .. } => "java/lang/ArrayIndexOutOfBoundsException",
            ArrayStore { .. } => "java/lang/ArrayStoreException",
            ClassCast { .. } => "java/lang/ClassCastException",
            NegativeArraySize(_) => "java/lang/NegativeArraySizeException",
            StackOverflow => "java/lang/StackOverflowError",
            OutOfMemory(_) => "java/lang/OutOfMemoryError",
            Internal(_) => "java/lang/InternalError",
            IllegalMonitorState(_) => "java/lang/IllegalMonitorStateException",
            Interrupted => "java/lang/InterruptedException",
            Thrown(_) => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_class_name_covers_every_non_thrown_variant() {
        assert_eq!(
            VmError::NullPointer.java_class_name(),
            Some("java/lang/NullPointerException")
        );
        assert_eq!(
            VmError::Arithmetic("/ by zero").java_class_name(),
            Some("java/lang/ArithmeticException")
        );
    }
}
