use memchr::memmem;

use crate::pattern::{CompiledPattern, PatternElement};

/// Returns true if `pattern` matches `haystack` starting at `pos`.
#[inline]
pub fn matches_at(haystack: &[u8], pos: usize, pattern: &CompiledPattern) -> bool {
    let elements = pattern.elements();
    match haystack.get(pos..).and_then(|rest| rest.get(..elements.len())) {
        Some(window) => elements.iter().zip(window).all(|(e, &b)| e.matches(b)),
        None => false,
    }
}

/// Gets the longest run of fixed bytes in the pattern and the offset of that
/// run within the pattern. The excerpt is empty if the pattern is nothing but
/// wildcards.
fn longest_excerpt(pattern: &CompiledPattern) -> (Vec<u8>, usize) {
    let mut best_excerpt = Vec::<u8>::new();
    let mut best_excerpt_offset = 0;
    let mut excerpt = Vec::<u8>::new();

    for (idx, element) in pattern.elements().iter().enumerate() {
        match element {
            PatternElement::Fixed(b) => excerpt.push(*b),
            PatternElement::Wildcard => {
                if excerpt.len() > best_excerpt.len() {
                    best_excerpt_offset = idx - excerpt.len();
                    best_excerpt = std::mem::take(&mut excerpt);
                }
                excerpt.clear();
            }
        }
    }
    if excerpt.len() > best_excerpt.len() {
        best_excerpt_offset = pattern.len() - excerpt.len();
        best_excerpt = excerpt;
    }
    (best_excerpt, best_excerpt_offset)
}

/// Returns every offset in `haystack` at which `pattern` matches, in
/// ascending order. Overlapping matches are all reported.
///
/// The longest fixed run of the pattern is searched for with `memmem` and
/// each hit is then checked against the whole pattern, which gives the same
/// offsets as sliding the pattern over every position.
pub fn find_all(haystack: &[u8], pattern: &CompiledPattern) -> Vec<usize> {
    let pat_len = pattern.len();
    if haystack.len() < pat_len {
        return Vec::new();
    }
    let last_start = haystack.len() - pat_len;

    let (excerpt, excerpt_offset) = longest_excerpt(pattern);
    if excerpt.is_empty() {
        return (0..=last_start).collect();
    }

    // Index k in `region` is the excerpt position for a match starting at k
    let region = &haystack[excerpt_offset..last_start + excerpt_offset + excerpt.len()];
    let finder = memmem::Finder::new(excerpt.as_slice());

    let mut offsets = Vec::new();
    let mut start = 0;
    while let Some(loc) = finder.find(&region[start..]) {
        let pattern_start = start + loc;
        if matches_at(haystack, pattern_start, pattern) {
            offsets.push(pattern_start);
        }
        start = pattern_start + 1;
    }
    offsets
}
