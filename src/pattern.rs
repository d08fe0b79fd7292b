use std::fmt;
use std::str::FromStr;

use log::warn;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid byte: {0}")]
    InvalidToken(String),
    #[error("pattern has no valid bytes")]
    Empty,
}

/// A single position in a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternElement {
    Fixed(u8),
    Wildcard,
}

impl PatternElement {
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            PatternElement::Fixed(b) => b == byte,
            PatternElement::Wildcard => true,
        }
    }
}

/// A non-empty sequence of fixed bytes and wildcards.
///
/// Only `compile` (or `FromStr`) can build one, so every instance holds at
/// least one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    elements: Vec<PatternElement>,
}

impl CompiledPattern {
    pub fn elements(&self) -> &[PatternElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl fmt::Display for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match element {
                PatternElement::Fixed(b) => write!(f, "{b:02X}")?,
                PatternElement::Wildcard => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

impl FromStr for CompiledPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        compile(s)
    }
}

/// Parses one whitespace-free token of a signature.
pub fn parse_token(token: &str) -> Result<PatternElement, PatternError> {
    if token == "?" || token == "??" {
        return Ok(PatternElement::Wildcard);
    }
    // from_str_radix alone would also accept a leading '+'
    if (1..=2).contains(&token.len()) && token.bytes().all(|b| b.is_ascii_hexdigit()) {
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| PatternError::InvalidToken(token.to_string()))?;
        return Ok(PatternElement::Fixed(byte));
    }
    Err(PatternError::InvalidToken(token.to_string()))
}

/// Compiles a signature such as `48 8B ?? 00`.
///
/// Tokens that are neither a wildcard nor a hex byte are dropped with a
/// warning. Fails only if nothing usable is left.
pub fn compile(text: &str) -> Result<CompiledPattern, PatternError> {
    let elements: Vec<PatternElement> = text
        .split_whitespace()
        .filter_map(|token| match parse_token(token) {
            Ok(element) => Some(element),
            Err(e) => {
                warn!("{e}");
                None
            }
        })
        .collect();

    if elements.is_empty() {
        return Err(PatternError::Empty);
    }
    Ok(CompiledPattern { elements })
}
