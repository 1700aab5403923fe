//! Command name → IR code resolution
//!
//! A command is one of:
//! - `b64:<base64>`: a literal code, padding optional
//! - 32 or more lowercase hex digits: a literal code
//! - a name looked up in the code library for a device
//!
//! Library entries are either one hex code or a pair of codes that
//! alternate on every send (toggle commands).

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DeviceError, Result};

const B64_PREFIX: &str = "b64:";
const RAW_HEX_MIN_LEN: usize = 32;

/// A learned code as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredCode {
    Single(String),
    Toggle([String; 2]),
}

/// device → command → code
pub type CodeLibrary = HashMap<String, HashMap<String, StoredCode>>;

/// device → index of the toggle code sent next (0 or 1)
pub type ToggleFlags = HashMap<String, u8>;

/// Outcome of resolving one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCode {
    /// Literal code given inline (hex or base64)
    Raw(Vec<u8>),
    /// Single code from the library
    Library(Vec<u8>),
    /// One half of a toggle pair; `device`'s flag flips once it is sent
    Toggle { code: Vec<u8>, device: String },
}

impl ResolvedCode {
    pub fn code(&self) -> &[u8] {
        match self {
            ResolvedCode::Raw(code) | ResolvedCode::Library(code) => code,
            ResolvedCode::Toggle { code, .. } => code,
        }
    }
}

fn is_raw_hex(command: &str) -> bool {
    command.len() >= RAW_HEX_MIN_LEN
        && command
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn decode_b64(value: &str) -> Result<Vec<u8>> {
    let mut padded = value.to_string();
    let extra = padded.len() % 4;
    if extra > 0 {
        padded.push_str(&"=".repeat(4 - extra));
    }
    base64::engine::general_purpose::STANDARD
        .decode(&padded)
        .map_err(|e| DeviceError::InvalidCode(format!("bad base64 '{}': {}", value, e)))
}

fn decode_stored(command: &str, code: &str) -> Result<Vec<u8>> {
    hex::decode(code).map_err(|e| {
        DeviceError::InvalidCode(format!("stored code for '{}' is not hex: {}", command, e))
    })
}

/// Resolve `command` for `device`
pub fn resolve_code(
    command: &str,
    device: Option<&str>,
    codes: &CodeLibrary,
    flags: &ToggleFlags,
) -> Result<ResolvedCode> {
    if let Some(encoded) = command.strip_prefix(B64_PREFIX) {
        return decode_b64(encoded).map(ResolvedCode::Raw);
    }

    if is_raw_hex(command) {
        return decode_stored(command, command).map(ResolvedCode::Raw);
    }

    let device = device.ok_or_else(|| DeviceError::MissingDevice {
        command: command.to_string(),
    })?;
    let stored = codes
        .get(device)
        .and_then(|commands| commands.get(command))
        .ok_or_else(|| DeviceError::CommandNotFound {
            device: device.to_string(),
            command: command.to_string(),
        })?;

    match stored {
        StoredCode::Single(code) => decode_stored(command, code).map(ResolvedCode::Library),
        StoredCode::Toggle(pair) => {
            let index = flags.get(device).copied().unwrap_or(0) & 1;
            Ok(ResolvedCode::Toggle {
                code: decode_stored(command, &pair[index as usize])?,
                device: device.to_string(),
            })
        }
    }
}
