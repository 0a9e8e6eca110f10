//! Key spans.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A key span `[key, end_key)`. An empty `end_key` makes it a point span
/// covering `key` alone.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Span {
    pub fn new(key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    /// A span covering the single key `key`.
    pub fn point(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: Vec::new(),
        }
    }

    pub fn is_point(&self) -> bool {
        self.end_key.is_empty()
    }

    /// A span is valid if it is a point or its end sorts after its start.
    pub fn valid(&self) -> bool {
        self.is_point() || self.key < self.end_key
    }

    /// Exclusive end of the span; for a point span, the immediate successor of
    /// the key.
    pub fn exclusive_end(&self) -> Vec<u8> {
        if self.is_point() {
            key_next(&self.key)
        } else {
            self.end_key.clone()
        }
    }

    /// Converts a point span into the equivalent range span.
    pub fn as_range(&self) -> Span {
        Span::new(self.key.clone(), self.exclusive_end())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        if self.is_point() {
            key == self.key.as_slice()
        } else {
            key >= self.key.as_slice() && key < self.end_key.as_slice()
        }
    }

    /// True if `other` lies entirely within `self`.
    pub fn contains(&self, other: &Span) -> bool {
        let a = self.as_range();
        let b = other.as_range();
        a.key <= b.key && b.end_key <= a.end_key
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        let a = self.as_range();
        let b = other.as_range();
        a.key < b.end_key && b.key < a.end_key
    }

    /// The overlap of two spans, if any, as a range span.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        if !self.overlaps(other) {
            return None;
        }
        let a = self.as_range();
        let b = other.as_range();
        let key = std::cmp::max(a.key, b.key);
        let end_key = std::cmp::min(a.end_key, b.end_key);
        Some(Span::new(key, end_key))
    }

    /// Smallest span covering both `self` and `other`.
    pub fn combine(&self, other: &Span) -> Span {
        let a = self.as_range();
        let b = other.as_range();
        Span::new(
            std::cmp::min(a.key, b.key),
            std::cmp::max(a.end_key, b.end_key),
        )
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_point() {
            write!(f, "{}", crate::keys::pretty(&self.key))
        } else {
            write!(
                f,
                "{}-{}",
                crate::keys::pretty(&self.key),
                crate::keys::pretty(&self.end_key)
            )
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The immediate successor of `key` in byte order.
pub fn key_next(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Merges overlapping or adjacent spans, returning them sorted.
pub fn merge_spans(mut spans: Vec<Span>) -> Vec<Span> {
    if spans.len() <= 1 {
        return spans;
    }
    spans.sort_by(|a, b| a.key.cmp(&b.key));
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match out.last_mut() {
            Some(last) if span.key <= last.exclusive_end() => {
                if span.exclusive_end() > last.exclusive_end() {
                    let merged = last.combine(&span);
                    *last = if merged.end_key == key_next(&merged.key) {
                        Span::point(merged.key)
                    } else {
                        merged
                    };
                }
            }
            _ => out.push(span),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_span() {
        let s = Span::point(b"k".to_vec());
        assert!(s.is_point());
        assert!(s.contains_key(b"k"));
        assert!(!s.contains_key(b"k\x00"));
        assert_eq!(s.exclusive_end(), b"k\x00".to_vec());
    }

    #[test]
    fn test_overlap_and_intersect() {
        let a = Span::new(b"a".to_vec(), b"m".to_vec());
        let b = Span::new(b"k".to_vec(), b"z".to_vec());
        let c = Span::new(b"m".to_vec(), b"z".to_vec());
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersect(&b), Some(Span::new(b"k".to_vec(), b"m".to_vec())));
        assert_eq!(a.intersect(&c), None);
        assert!(Span::new(b"a".to_vec(), b"z".to_vec()).contains(&b));
        assert!(a.overlaps(&Span::point(b"c".to_vec())));
    }

    #[test]
    fn test_merge_spans() {
        let merged = merge_spans(vec![
            Span::point(b"c".to_vec()),
            Span::new(b"a".to_vec(), b"b".to_vec()),
            Span::new(b"b".to_vec(), b"c".to_vec()),
            Span::point(b"x".to_vec()),
            Span::point(b"x".to_vec()),
        ]);
        assert_eq!(
            merged,
            vec![
                Span::new(b"a".to_vec(), b"c\x00".to_vec()),
                Span::point(b"x".to_vec()),
            ]
        );
    }
}
