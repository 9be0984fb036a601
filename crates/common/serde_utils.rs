//! Helpers for the JSON-shaped snapshot and genesis formats, which accept
//! numbers as decimal or 0x-prefixed hex strings and byte strings as 0x hex.

use ethereum_types::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid numeric literal: {0}")]
    InvalidNumber(String),
    #[error("Invalid hex literal: {0}")]
    InvalidHex(String),
}

/// Parses a decimal or 0x-hex string into a U256.
pub fn parse_as_int(value: &str) -> Result<U256, ParseError> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).ok()
    } else {
        U256::from_dec_str(value).ok()
    };
    parsed.ok_or_else(|| ParseError::InvalidNumber(value.to_string()))
}

/// Parses a decimal or 0x-hex string into a u64.
pub fn parse_as_u64(value: &str) -> Result<u64, ParseError> {
    let parsed = parse_as_int(value)?;
    if parsed > U256::from(u64::MAX) {
        return Err(ParseError::InvalidNumber(value.to_string()));
    }
    Ok(parsed.as_u64())
}

/// Parses a 0x-prefixed (or bare) hex string into bytes.
pub fn parse_as_bin(value: &str) -> Result<Vec<u8>, ParseError> {
    let hex_str = value.strip_prefix("0x").unwrap_or(value);
    // An odd nibble count gets a leading zero, as the upstream format allows
    let padded;
    let hex_str = if hex_str.len() % 2 == 1 {
        padded = format!("0{hex_str}");
        &padded
    } else {
        hex_str
    };
    hex::decode(hex_str).map_err(|_| ParseError::InvalidHex(value.to_string()))
}

/// Formats bytes as a 0x-prefixed hex string.
pub fn encode_hex_0x(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}
