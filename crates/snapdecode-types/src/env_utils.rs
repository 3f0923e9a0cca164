//! Environment variable parsing utilities.
//!
//! Type-safe helpers for the `SNAPDECODE_*` overrides, so call sites avoid the
//! usual `std::env::var(..).ok().and_then(..)` chains.
//!
//! # Example
//!
//! ```
//! use snapdecode_types::env_utils::{env_string, env_u64};
//!
//! let flags: u64 = env_u64("SNAPDECODE_MUTEX_FLAGS").unwrap_or(0x07);
//! let config: Option<String> = env_string("SNAPDECODE_CONFIG");
//! ```

/// Parse an integer environment variable, accepting decimal or `0x` hex.
///
/// Masks and flag words are usually written in hex, so both forms are taken.
pub fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Get a non-empty environment variable as a string.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_u64_hex_and_decimal() {
        std::env::set_var("SNAPDECODE_TEST_HEX", "0x20");
        std::env::set_var("SNAPDECODE_TEST_DEC", "32");
        std::env::set_var("SNAPDECODE_TEST_BAD", "0xnope");

        assert_eq!(env_u64("SNAPDECODE_TEST_HEX"), Some(0x20));
        assert_eq!(env_u64("SNAPDECODE_TEST_DEC"), Some(32));
        assert_eq!(env_u64("SNAPDECODE_TEST_BAD"), None);
        assert_eq!(env_u64("SNAPDECODE_NONEXISTENT_2"), None);

        std::env::remove_var("SNAPDECODE_TEST_HEX");
        std::env::remove_var("SNAPDECODE_TEST_DEC");
        std::env::remove_var("SNAPDECODE_TEST_BAD");
    }

    #[test]
    fn test_env_string_skips_blank() {
        std::env::set_var("SNAPDECODE_TEST_BLANK", "   ");
        assert_eq!(env_string("SNAPDECODE_TEST_BLANK"), None);
        std::env::remove_var("SNAPDECODE_TEST_BLANK");
    }
}
