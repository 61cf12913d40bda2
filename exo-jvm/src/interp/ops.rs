//! Pure arithmetic, conversion, and comparison helpers for the interpreter's
//! dispatch loop (§4.6). Split out from `mod.rs` so the dispatch match stays
//! readable; every function here is a direct transcription of the bytecode's
//! JLS-mandated numeric semantics (wrapping add/sub/mul, truncating
//! division, IEEE 754 comparisons with the `g`/`l` NaN bias).

use crate::error::{VmError, VmResult};
use crate::object::Value;
use crate::signal::{check_divisor_i32, check_divisor_i64};

pub fn iadd(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}
pub fn isub(a: i32, b: i32) -> i32 {
    a.wrapping_sub(b)
}
pub fn imul(a: i32, b: i32) -> i32 {
    a.wrapping_mul(b)
}
pub fn idiv(a: i32, b: i32) -> VmResult<i32> {
    check_divisor_i32(b)?;
    Ok(a.wrapping_div(b))
}
pub fn irem(a: i32, b: i32) -> VmResult<i32> {
    check_divisor_i32(b)?;
    Ok(a.wrapping_rem(b))
}

pub fn ladd(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}
pub fn lsub(a: i64, b: i64) -> i64 {
    a.wrapping_sub(b)
}
pub fn lmul(a: i64, b: i64) -> i64 {
    a.wrapping_mul(b)
}
pub fn ldiv(a: i64, b: i64) -> VmResult<i64> {
    check_divisor_i64(b)?;
    Ok(a.wrapping_div(b))
}
pub fn lrem(a: i64, b: i64) -> VmResult<i64> {
    check_divisor_i64(b)?;
    Ok(a.wrapping_rem(b))
}

/// `lcmp`: -1/0/1, no NaN case (longs have no NaN).
pub fn lcmp(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// `fcmpg`/`dcmpg` (`nan_is_greater = true`) and `fcmpl`/`dcmpl`
/// (`nan_is_greater = false`) per JVMS §6.5.
pub fn fcmp(a: f64, b: f64, nan_is_greater: bool) -> i32 {
    if a.is_nan() || b.is_nan() {
        return if nan_is_greater { 1 } else { -1 };
    }
    if a > b {
        1
    } else if a < b {
        -1
    } else {
        0
    }
}

/// Extracts the `as i32` operand for int opcodes, erroring if the stack slot
/// does not hold one (a verifier-enforced invariant the core re-checks since
/// it runs unverified bytecode too).
pub fn as_int(v: Value) -> VmResult<i32> {
    match v {
        Value::Int(i) => Ok(i),
        other => Err(VmError::Internal(format!("expected int operand, found {other:?}"))),
    }
}

pub fn as_long(v: Value) -> VmResult<i64> {
    match v {
        Value::Long(l) => Ok(l),
        other => Err(VmError::Internal(format!("expected long operand, found {other:?}"))),
    }
}

pub fn as_float(v: Value) -> VmResult<f32> {
    match v {
        Value::Float(f) => Ok(f),
        other => Err(VmError::Internal(format!("expected float operand, found {other:?}"))),
    }
}

pub fn as_double(v: Value) -> VmResult<f64> {
    match v {
        Value::Double(d) => Ok(d),
        other => Err(VmError::Internal(format!("expected double operand, found {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idiv_by_zero_is_arithmetic_exception() {
        assert!(matches!(idiv(1, 0), Err(VmError::Arithmetic(_))));
    }

    #[test]
    fn fcmpg_biases_nan_positive() {
        assert_eq!(fcmp(f64::NAN, 1.0, true), 1);
        assert_eq!(fcmp(f64::NAN, 1.0, false), -1);
    }

    #[test]
    fn lcmp_orders_correctly() {
        assert_eq!(lcmp(1, 2), -1);
        assert_eq!(lcmp(2, 2), 0);
        assert_eq!(lcmp(3, 2), 1);
    }
}
