// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::error::{CoreError, CoreResult, SandboxFault};

/// Symbols a handler must never reference. The list screens the host
/// surface of the language the handlers are written in; the runtime
/// environment simply does not contain these, so the screen is advisory
/// and the restricted environment is what actually holds.
const BLOCKED_SYMBOLS: &[&str] = &[
    "os.",
    "io.",
    "require",
    "dofile",
    "loadfile",
    "loadstring",
    "load(",
    "rawget",
    "rawset",
    "rawequal",
    "getmetatable",
    "setmetatable",
    "getfenv",
    "setfenv",
    "collectgarbage",
    "coroutine",
    "debug.",
    "package.",
    "string.dump",
    "string.char",
    "string.byte",
    "_G",
    "_ENV",
];

/// Numeric/byte escapes above this count read as an attempt to assemble a
/// blocked symbol at runtime.
const MAX_BYTE_ESCAPES: usize = 8;

/// Screens handler source before first execution.
pub fn static_screen(source: &str) -> CoreResult<()> {
    for symbol in BLOCKED_SYMBOLS {
        if source.contains(symbol) {
            return Err(CoreError::sandbox(
                SandboxFault::ForbiddenAccess,
                format!("blocked symbol: {symbol}"),
            ));
        }
    }

    let escapes = count_byte_escapes(source);
    if escapes > MAX_BYTE_ESCAPES {
        return Err(CoreError::sandbox(
            SandboxFault::ForbiddenAccess,
            format!("suspicious byte escapes: {escapes}"),
        ));
    }

    Ok(())
}

/// Counts `\ddd` and `\x..` escapes.
fn count_byte_escapes(source: &str) -> usize {
    let bytes = source.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\\' {
            let next = bytes[i + 1];
            if next.is_ascii_digit() || next == b'x' || next == b'X' {
                count += 1;
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_passes() {
        let src = "response.write(html.escape(request.path))";
        assert!(static_screen(src).is_ok());
    }

    #[test]
    fn test_blocked_symbol_rejected() {
        let src = "local f = io.open('/etc/passwd')";
        let err = static_screen(src).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sandbox {
                kind: SandboxFault::ForbiddenAccess,
                ..
            }
        ));
    }

    #[test]
    fn test_byte_escape_flood_rejected() {
        let src = r#"local s = "\105\111\46\111\112\101\110\40\41\59""#;
        assert!(static_screen(src).is_err());
    }

    #[test]
    fn test_few_escapes_tolerated() {
        let src = r#"print("line\nbreak \9tab")"#;
        assert!(static_screen(src).is_ok());
    }
}
