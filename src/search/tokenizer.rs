// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// One indexable token and where it starts in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub byte_pos: u32,
}

/// Splits on anything that is not alphanumeric or a hyphen, lowercases,
/// and drops tokens that are too short, purely numeric, or hyphens only.
pub fn tokenize(text: &str) -> Vec<Token> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start: Option<usize> = None;

    for i in 0..=bytes.len() {
        let is_token_byte = i < bytes.len()
            && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-');
        match (start, is_token_byte) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                push_token(&mut out, &text[s..i], s);
                start = None;
            },
            _ => {},
        }
    }
    out
}

fn push_token(out: &mut Vec<Token>, raw: &str, pos: usize) {
    if raw.len() < 2 {
        return;
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return;
    }
    if !raw.bytes().any(|b| b.is_ascii_alphanumeric()) {
        return;
    }
    out.push(Token {
        text: raw.to_ascii_lowercase(),
        byte_pos: pos as u32,
    });
}

/// Tokenize and keep only the normalized strings.
pub fn terms(text: &str) -> Vec<String> {
    tokenize(text).into_iter().map(|t| t.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_and_lowercases() {
        let toks = tokenize("Turtle Mining, guide!");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turtle", "mining", "guide"]);
    }

    #[test]
    fn test_positions_are_byte_offsets() {
        let toks = tokenize("ab cd");
        assert_eq!(toks[0].byte_pos, 0);
        assert_eq!(toks[1].byte_pos, 3);
    }

    #[test]
    fn test_drops_short_and_numeric() {
        let toks = tokenize("a 42 x9 -- self-test");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["x9", "self-test"]);
    }

    #[test]
    fn test_hyphenated_stays_whole() {
        let toks = tokenize("robots.txt crawl-delay");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["robots", "txt", "crawl-delay"]);
    }
}
