//! Explicit-check simulation of the faults a native JVM fields through a
//! SIGSEGV/SIGFPE handler (§4.10 "Implementation note"): this core has no
//! process-level trap handler, so every dereference/divide/array-index site
//! in `crate::interp` calls one of these checks itself at the point a real
//! VM would instead recover from a trapped instruction.
//!
//! Also owns the bridge from a core-internal [`VmError`] to a live Java
//! exception object, since turning a fault into something `athrow`'s
//! exception-table search can `instanceof`-match against is the other half
//! of "signal delivery" once there is no real signal to deliver.

use crate::error::{VmError, VmResult};
use crate::object::ObjectRef;
use crate::thread::ThreadHandle;
use crate::types::TypeName;
use crate::vm::Jvm;

pub fn check_null(obj: Option<ObjectRef>) -> VmResult<ObjectRef> {
    obj.ok_or(VmError::NullPointer)
}

pub fn check_bounds(index: i32, length: i32) -> VmResult<()> {
    if index < 0 || index >= length {
        return Err(VmError::ArrayIndexOutOfBounds { index, length });
    }
    Ok(())
}

pub fn check_divisor_i32(b: i32) -> VmResult<()> {
    if b == 0 {
        return Err(VmError::Arithmetic("/ by zero"));
    }
    Ok(())
}

pub fn check_divisor_i64(b: i64) -> VmResult<()> {
    if b == 0 {
        return Err(VmError::Arithmetic("/ by zero"));
    }
    Ok(())
}

/// Turns any [`VmError`] into a throwable object: a no-op for an error that
/// already carries one (`Thrown`), otherwise allocates a bare instance of
/// the mapped `java.lang.*` class under the bootstrap loader. The core owns
/// no `java.lang.Throwable` constructor logic, so the instance carries no
/// message/cause/stack trace — only enough identity for `instanceof` to
/// match it against a handler's catch type.
pub fn materialize(jvm: &Jvm, thread: &ThreadHandle, err: &VmError) -> VmResult<ObjectRef> {
    if let VmError::Thrown(obj) = err {
        return Ok(*obj);
    }
    let class_name = err
        .java_class_name()
        .ok_or_else(|| VmError::Internal(format!("{err} has no Java exception mapping")))?;
    let loader = jvm.loaders().bootstrap();
    let ty = jvm.resolve_class(&loader, &TypeName(class_name.to_string()), thread)?;
    jvm.new_instance(&ty)
}
