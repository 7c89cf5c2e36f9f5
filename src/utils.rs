// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

const TOKEN_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a random opaque token of `len` alphanumeric characters.
///
/// Used for session identifiers and CSRF tokens; the value carries no
/// structure beyond uniqueness.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let idx = rng.random_range(0..TOKEN_ALPHABET.len());
        out.push(TOKEN_ALPHABET[idx] as char);
    }
    out
}

/// Generates 4 random bytes and returns their hexadecimal representation.
///
/// Appended to message ids so two processes restarting with the same
/// sequence counter cannot collide inside the replay window.
pub fn id_entropy() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill(&mut bytes);

    let mut hex = String::with_capacity(8);
    for byte in &bytes {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}
