use super::types::RespValue;
use crate::error::{ClientError, Result};
use bytes::Bytes;

/// Build a request in canonical wire form: a fixed-size array of bulk
/// strings, one per command part.
pub fn request<T: AsRef<[u8]>>(parts: &[T]) -> RespValue {
    RespValue::Array(Some(
        parts
            .iter()
            .map(|p| RespValue::BulkString(Some(Bytes::copy_from_slice(p.as_ref()))))
            .collect(),
    ))
}

/// The key a request routes on: element index 1 of the canonical form.
///
/// Keyless commands (PING, MULTI, CLUSTER ...) either have no second
/// element or are dispatched with an explicit target address instead of
/// going through slot routing, so a positional rule is enough here.
pub fn request_key(request: &RespValue) -> Option<&[u8]> {
    request.as_array()?.get(1)?.as_bytes()
}

/// Parse a human-typed command line into a request.
///
/// Tokens split on whitespace; double-quoted tokens may contain spaces
/// and the escapes `\"`, `\\`, `\n`, `\r`, `\t`.
pub fn parse_command_line(line: &str) -> Result<RespValue> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        None => {
                            return Err(ClientError::CommandLine(
                                "unterminated quote".to_string(),
                            ))
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            None => {
                                return Err(ClientError::CommandLine(
                                    "unterminated quote".to_string(),
                                ))
                            }
                            Some('n') => current.push('\n'),
                            Some('r') => current.push('\r'),
                            Some('t') => current.push('\t'),
                            Some(other) => current.push(other),
                        },
                        Some(other) => current.push(other),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        parts.push(current);
    }

    if parts.is_empty() {
        return Err(ClientError::CommandLine("empty command".to_string()));
    }

    Ok(request(&parts))
}

pub fn cluster_slots() -> RespValue {
    request(&["CLUSTER", "SLOTS"])
}

pub fn asking() -> RespValue {
    request(&["ASKING"])
}

pub fn multi() -> RespValue {
    request(&["MULTI"])
}

pub fn exec() -> RespValue {
    request(&["EXEC"])
}
