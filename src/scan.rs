use crate::pattern::Pattern;

/// Result of looking for a pattern that must occur exactly once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Match {
    Unique(usize),
    NotFound,
    Ambiguous(usize),
}

/// Returns the start offsets of all non-overlapping occurrences of `pattern`,
/// left to right. After a match the scan resumes at its end.
///
/// An empty pattern never matches. Patch patterns cannot be empty:
/// `Pattern::compile` rejects them with `EmptyPattern` before any scan.
pub fn find_all(haystack: &[u8], pattern: &Pattern) -> Vec<usize> {
    let mut offsets = Vec::new();
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return offsets;
    }

    let last = haystack.len() - pattern.len();
    let mut start = 0;
    while start <= last {
        if pattern.matches(&haystack[start..]) {
            offsets.push(start);
            start += pattern.len();
        } else {
            start += 1;
        }
    }
    offsets
}

pub fn find_unique(haystack: &[u8], pattern: &Pattern) -> Match {
    let offsets = find_all(haystack, pattern);
    match offsets.len() {
        0 => Match::NotFound,
        1 => Match::Unique(offsets[0]),
        n => Match::Ambiguous(n),
    }
}
