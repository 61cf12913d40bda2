//! System property keys recognized by the core, and the `K`/`M`/`G`-suffixed
//! size parser used for all of `jc.stack.*`/`jc.heap.*`/`jc.loader.size`.

use crate::error::{VmError, VmResult};

pub const BOOT_CLASS_PATH: &str = "java.boot.class.path";
pub const BOOT_CLASS_PATH_PREPEND: &str = "java.boot.class.path.prepend";
pub const BOOT_CLASS_PATH_APPEND: &str = "java.boot.class.path.append";
pub const STACK_MINIMUM: &str = "jc.stack.minimum";
pub const STACK_MAXIMUM: &str = "jc.stack.maximum";
pub const STACK_DEFAULT: &str = "jc.stack.default";
pub const JAVA_STACK_SIZE: &str = "jc.java.stack.size";
pub const HEAP_SIZE: &str = "jc.heap.size";
pub const HEAP_GRANULARITY: &str = "jc.heap.granularity";
pub const LOADER_SIZE: &str = "jc.loader.size";
pub const VERBOSE_PREFIX: &str = "jc.verbose.";

/// Smallest stack the host platform accepts; stands in for the `PTHREAD_STACK_MIN`
/// floor the original enforces.
pub const MINIMUM_STACK_BYTES: u64 = 16 * 1024;

/// Parses a `K`/`M`/`G`-suffixed size property (case-insensitive suffix,
/// decimal digits only). `"512K"`, `"64M"`, `"2G"`, and bare `"1048576"` are
/// all accepted.
pub fn parse_size(raw: &str) -> VmResult<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(VmError::Internal("empty size property".into()));
    }
    let (digits, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b'k' | b'K' => (&raw[..raw.len() - 1], 1024u64),
        b'm' | b'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| VmError::Internal(format!("invalid size property {raw:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| VmError::Internal(format!("size property overflow: {raw:?}")))
}

/// Validates a parsed stack size against the platform minimum.
pub fn validate_stack_size(bytes: u64) -> VmResult<u64> {
    if bytes < MINIMUM_STACK_BYTES {
        return Err(VmError::Internal(format!(
            "stack size {bytes} below platform minimum {MINIMUM_STACK_BYTES}"
        )));
    }
    Ok(bytes)
}

/// Returns the verbose tag named by a `jc.verbose.<tag>` property key, if any.
pub fn verbose_tag(key: &str) -> Option<&str> {
    key.strip_prefix(VERBOSE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("512K", 512 * 1024)]
    #[case("64M", 64 * 1024 * 1024)]
    #[case("2G", 2 * 1024 * 1024 * 1024)]
    #[case("1048576", 1048576)]
    #[case("8k", 8 * 1024)]
    fn parses_suffixed_sizes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_size(input).unwrap(), expected);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn enforces_platform_minimum() {
        assert!(validate_stack_size(1024).is_err());
        assert!(validate_stack_size(MINIMUM_STACK_BYTES).is_ok());
    }

    #[test]
    fn extracts_verbose_tag() {
        assert_eq!(verbose_tag("jc.verbose.gc"), Some("gc"));
        assert_eq!(verbose_tag("jc.heap.size"), None);
    }
}
