//! Compiles hex pattern text into byte-or-wildcard sequences.
//!
//! Pattern text is a list of two-character hex tokens separated by whitespace.
//! The token `**` matches any byte. `%NAME%` anywhere in the text is replaced
//! by the value the selected variant binds to `NAME` before parsing.

use crate::error::{
    EmptyPattern, InvalidHex, OddHexDigits, Result, UnboundVariable, WildcardInReplacement,
};
use crate::patch::{PatchDefinition, PatchVariant};
use snafu::{ensure, OptionExt};
use std::fmt;

const WILDCARD: &str = "**";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatternByte {
    Literal(u8),
    Wildcard,
}

impl PatternByte {
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            PatternByte::Literal(b) => b == byte,
            PatternByte::Wildcard => true,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
}

impl Pattern {
    pub fn new(bytes: Vec<PatternByte>) -> Self {
        Pattern { bytes }
    }

    pub fn literal(bytes: &[u8]) -> Self {
        Pattern {
            bytes: bytes.iter().map(|&b| PatternByte::Literal(b)).collect(),
        }
    }

    /// Parses pattern text that has no placeholders left.
    pub fn parse(text: &str) -> Result<Self> {
        let digits = strip_whitespace(text);
        ensure!(digits.len() % 2 == 0, OddHexDigits { text });

        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.as_bytes().chunks(2) {
            if pair == WILDCARD.as_bytes() {
                bytes.push(PatternByte::Wildcard);
            } else {
                bytes.push(PatternByte::Literal(hex_byte(pair, text)?));
            }
        }
        Ok(Pattern { bytes })
    }

    /// Builds the concrete pattern of `patch` for `variant`.
    pub fn compile(patch: &PatchDefinition, variant: &PatchVariant) -> Result<Self> {
        let joined = patch.pattern.join(" ");
        let text = substitute(joined.trim(), variant)?;
        let pattern = Pattern::parse(&text)?;
        ensure!(!pattern.is_empty(), EmptyPattern { patch: patch.id.as_str() });
        Ok(pattern)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[PatternByte] {
        &self.bytes
    }

    /// Returns whether `window` starts with this pattern.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.bytes.len()
            && self.bytes.iter().zip(window).all(|(p, &b)| p.matches(b))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match byte {
                PatternByte::Literal(b) => write!(f, "{:02X}", b)?,
                PatternByte::Wildcard => f.write_str(WILDCARD)?,
            }
        }
        Ok(())
    }
}

/// Compiles replacement bytes. Placeholders are substituted like in patterns
/// but the result must be plain hex.
pub fn compile_bytes(text: &str, variant: &PatchVariant) -> Result<Vec<u8>> {
    let text = substitute(text.trim(), variant)?;
    let digits = strip_whitespace(&text);
    ensure!(digits.len() % 2 == 0, OddHexDigits { text: text.as_str() });

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            ensure!(
                pair != WILDCARD.as_bytes(),
                WildcardInReplacement { text: text.as_str() }
            );
            hex_byte(pair, &text)
        })
        .collect()
}

/// Replaces every `%name%` in `text` with the value bound by `variant`.
/// Values are inserted verbatim and not scanned again.
pub fn substitute(text: &str, variant: &PatchVariant) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('%') {
        let after = &rest[open + 1..];
        let close = match after.find('%') {
            Some(close) => close,
            None => break,
        };
        let name = &after[..close];
        let value = variant.value(name).context(UnboundVariable {
            name,
            variant: variant.id.as_str(),
        })?;
        out.push_str(&rest[..open]);
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn hex_byte(pair: &[u8], text: &str) -> Result<u8> {
    let mut byte = [0u8; 1];
    match hex::decode_to_slice(pair, &mut byte) {
        Ok(()) => Ok(byte[0]),
        Err(_) => InvalidHex {
            token: String::from_utf8_lossy(pair).into_owned(),
            text,
        }
        .fail(),
    }
}
