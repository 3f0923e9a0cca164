//! Encoding utilities for addresses and byte blobs.
//!
//! Provides shared parsing/formatting functions used across workspace crates.
//! These eliminate repetitive error handling patterns.

use anyhow::{anyhow, Result};

use crate::Address;

// =============================================================================
// Address Parsing
// =============================================================================

/// Parse a hex string to an [`Address`] with context-aware error message.
///
/// # Arguments
/// * `hex_str` - Hex string (with or without 0x prefix)
/// * `context` - Description for error messages (e.g., "mutex address")
///
/// # Examples
///
/// ```
/// use snapdecode_types::encoding::parse_address;
///
/// let addr = parse_address("0xffff888000001000", "mutex").unwrap();
/// assert_eq!(addr, 0xffff_8880_0000_1000);
/// ```
pub fn parse_address(hex_str: &str, context: &str) -> Result<Address> {
    let trimmed = hex_str.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    Address::from_str_radix(digits, 16)
        .map_err(|e| anyhow!("Invalid {} '{}': {}", context, hex_str, e))
}

/// Format an address the way reports print it (`0x` + minimal hex digits).
pub fn format_address(addr: Address) -> String {
    format!("0x{:x}", addr)
}

// =============================================================================
// Byte Blobs
// =============================================================================

/// Parse a hex string to raw bytes.
///
/// # Arguments
/// * `hex_str` - Hex string (with or without 0x prefix)
/// * `context` - Description for error messages
pub fn parse_hex_bytes(hex_str: &str, context: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| anyhow!("Invalid {} hex '{}': {}", context, hex_str, e))
}

/// Encode raw bytes as a lowercase hex string without prefix.
pub fn hex_bytes(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x10", "test").unwrap(), 0x10);
        assert_eq!(parse_address("ffff", "test").unwrap(), 0xffff);
        assert_eq!(parse_address("  0XAB ", "test").unwrap(), 0xab);

        let result = parse_address("not-hex", "lock address");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid lock address"));
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0), "0x0");
        assert_eq!(format_address(0xdead_beef), "0xdeadbeef");
    }

    #[test]
    fn test_hex_bytes() {
        let bytes = parse_hex_bytes("0x00ff10", "segment").unwrap();
        assert_eq!(bytes, vec![0x00, 0xff, 0x10]);
        assert_eq!(hex_bytes(&bytes), "00ff10");
        assert!(parse_hex_bytes("0xzz", "segment").is_err());
    }
}
