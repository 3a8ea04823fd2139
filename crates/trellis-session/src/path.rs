// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical parameter names.
//!
//! A [`Path`] is an ordered sequence of segments. A segment is a name, an
//! instance number, the wildcard `*`, or an alias expression - a bracketed
//! list of `subpath=value` constraints that selects an instance by content
//! rather than by number:
//!
//! ```text
//! InternetGatewayDevice.WANDevice.1.Name
//! InternetGatewayDevice.WANDevice.*.Name
//! InternetGatewayDevice.WANDevice.[Name=wan0].Enable
//! ```
//!
//! Two bitmasks cache which positions hold wildcards and which hold aliases;
//! the planner consults them constantly, so they are computed once at parse
//! time. Paths are interned in a [`crate::path_set::PathSet`]; everywhere
//! else they travel as `Arc<Path>`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Hard depth limit. The bitmask representation holds 32 positions; real
/// data models stay far below this.
pub const MAX_DEPTH: usize = 32;

/// One path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A literal name, e.g. `DeviceInfo`.
    Name(String),
    /// An instance number, e.g. `3`.
    Instance(u32),
    /// The wildcard `*`, matching any single segment.
    Wildcard,
    /// An alias expression: `(subpath, literal)` equality constraints,
    /// sorted by subpath for a canonical form.
    Alias(Vec<(Path, String)>),
}

impl Segment {
    fn rank(&self) -> u8 {
        match self {
            Segment::Name(_) | Segment::Instance(_) => 0,
            Segment::Alias(_) => 1,
            Segment::Wildcard => 2,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(s) => f.write_str(s),
            Segment::Instance(n) => write!(f, "{}", n),
            Segment::Wildcard => f.write_str("*"),
            Segment::Alias(pairs) => {
                f.write_str("[")?;
                for (i, (sub, val)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}={}", sub, val)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    /// Concrete segments sort before aliases, aliases before wildcards; the
    /// declaration walk depends on exact nodes being visited first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

/// An interned-able hierarchical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<Segment>,
    wildcard: u32,
    alias: u32,
}

/// Errors from [`Path::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathParseError {
    /// Two consecutive dots, or a trailing dot followed by nothing.
    #[error("empty segment in path {0:?}")]
    EmptySegment(String),

    /// An alias expression without its closing bracket.
    #[error("unterminated alias in path {0:?}")]
    UnterminatedAlias(String),

    /// An alias pair missing the `=` separator.
    #[error("malformed alias pair {0:?}")]
    MalformedAliasPair(String),

    /// More segments than [`MAX_DEPTH`].
    #[error("path exceeds maximum depth: {0:?}")]
    TooDeep(String),
}

impl Path {
    /// The empty (root) path.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            wildcard: 0,
            alias: 0,
        }
    }

    /// Build a path from segments, recomputing the bitmasks.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let mut wildcard = 0u32;
        let mut alias = 0u32;
        for (i, seg) in segments.iter().enumerate() {
            match seg {
                Segment::Wildcard => wildcard |= 1 << i,
                Segment::Alias(_) => alias |= 1 << i,
                _ => {}
            }
        }
        Self {
            segments,
            wildcard,
            alias,
        }
    }

    /// Parse a dot-separated path. A trailing dot (the CWMP partial-path
    /// convention) is accepted and stripped.
    pub fn parse(s: &str) -> Result<Self, PathParseError> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if segments.len() >= MAX_DEPTH {
                return Err(PathParseError::TooDeep(s.to_string()));
            }
            if bytes[i] == b'[' {
                let mut depth = 1usize;
                let start = i + 1;
                let mut end = None;
                let mut j = start;
                while j < bytes.len() {
                    match bytes[j] {
                        b'[' => depth += 1,
                        b']' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                let end = end.ok_or_else(|| PathParseError::UnterminatedAlias(s.to_string()))?;
                segments.push(parse_alias(&s[start..end], s)?);
                i = end + 1;
                // Skip the separating dot, if any.
                if i < bytes.len() {
                    if bytes[i] != b'.' {
                        return Err(PathParseError::MalformedAliasPair(s.to_string()));
                    }
                    i += 1;
                    if i == bytes.len() {
                        return Err(PathParseError::EmptySegment(s.to_string()));
                    }
                }
            } else {
                let start = i;
                while i < bytes.len() && bytes[i] != b'.' {
                    i += 1;
                }
                let seg = &s[start..i];
                if seg.is_empty() {
                    return Err(PathParseError::EmptySegment(s.to_string()));
                }
                segments.push(parse_plain_segment(seg));
                if i < bytes.len() {
                    i += 1; // consume the dot
                    if i == bytes.len() {
                        return Err(PathParseError::EmptySegment(s.to_string()));
                    }
                }
            }
        }

        Ok(Self::from_segments(segments))
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Bitmask of wildcard positions.
    pub fn wildcard_mask(&self) -> u32 {
        self.wildcard
    }

    /// Bitmask of alias positions.
    pub fn alias_mask(&self) -> u32 {
        self.alias
    }

    /// True when no segment is a wildcard or alias.
    pub fn is_concrete(&self) -> bool {
        self.wildcard == 0 && self.alias == 0
    }

    /// Sub-path covering `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.segments.len());
        let start = start.min(end);
        Self::from_segments(self.segments[start..end].to_vec())
    }

    /// The parent path (one segment shorter). The root's parent is the root.
    pub fn parent(&self) -> Self {
        if self.segments.is_empty() {
            return self.clone();
        }
        self.slice(0, self.segments.len() - 1)
    }

    /// This path extended by `other`'s segments.
    pub fn concat(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self::from_segments(segments)
    }

    /// This path extended by one segment.
    pub fn child(&self, seg: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(seg);
        Self::from_segments(segments)
    }

    /// True when `prefix`'s segments are a leading run of this path's.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// First segment as a name, when it is one. The planner dispatches on
    /// this for the ACS-virtual roots (`Tags`, `Reboot`, `Downloads`, ...).
    pub fn root_name(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Name(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convenience: an interned-style shared handle without a `PathSet`.
    pub fn shared(self) -> Arc<Path> {
        Arc::new(self)
    }
}

fn parse_plain_segment(seg: &str) -> Segment {
    if seg == "*" {
        Segment::Wildcard
    } else if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
        match seg.parse::<u32>() {
            Ok(n) => Segment::Instance(n),
            Err(_) => Segment::Name(seg.to_string()),
        }
    } else {
        Segment::Name(seg.to_string())
    }
}

fn parse_alias(body: &str, whole: &str) -> Result<Segment, PathParseError> {
    let mut pairs = Vec::new();
    for part in split_top_level(body) {
        let (sub, val) = part
            .split_once('=')
            .ok_or_else(|| PathParseError::MalformedAliasPair(whole.to_string()))?;
        let sub_path = Path::parse(sub)?;
        if sub_path.is_empty() {
            return Err(PathParseError::MalformedAliasPair(whole.to_string()));
        }
        pairs.push((sub_path, val.to_string()));
    }
    if pairs.is_empty() {
        return Err(PathParseError::MalformedAliasPair(whole.to_string()));
    }
    // Canonical order, so equal alias sets compare equal.
    pairs.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
    Ok(Segment::Alias(pairs))
}

/// Split on commas that are not nested inside brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl serde::Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Path {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        Path::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .map(|(a, b)| a.cmp(b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| self.segments.len().cmp(&other.segments.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let p = Path::parse("InternetGatewayDevice.DeviceInfo.SoftwareVersion").unwrap();
        assert_eq!(p.len(), 3);
        assert!(p.is_concrete());
        assert_eq!(
            p.to_string(),
            "InternetGatewayDevice.DeviceInfo.SoftwareVersion"
        );
    }

    #[test]
    fn test_parse_trailing_dot_stripped() {
        let p = Path::parse("InternetGatewayDevice.").unwrap();
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_parse_root() {
        let p = Path::parse("").unwrap();
        assert!(p.is_empty());
        assert_eq!(p.to_string(), "");
    }

    #[test]
    fn test_parse_instance_and_wildcard_masks() {
        let p = Path::parse("A.3.*.B.*").unwrap();
        assert_eq!(p.segments()[1], Segment::Instance(3));
        assert_eq!(p.wildcard_mask(), 0b10100);
        assert_eq!(p.alias_mask(), 0);
        assert!(!p.is_concrete());
    }

    #[test]
    fn test_parse_alias_canonical_order() {
        let a = Path::parse("IF.[B=2,A=1].X").unwrap();
        let b = Path::parse("IF.[A=1,B=2].X").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "IF.[A=1,B=2].X");
        assert_eq!(a.alias_mask(), 0b10);
    }

    #[test]
    fn test_parse_alias_nested_subpath() {
        let p = Path::parse("IF.[Stats.Errors=0]").unwrap();
        match &p.segments()[1] {
            Segment::Alias(pairs) => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].0.to_string(), "Stats.Errors");
                assert_eq!(pairs[0].1, "0");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Path::parse("A..B"),
            Err(PathParseError::EmptySegment(_))
        ));
        assert!(matches!(
            Path::parse("A.[Name"),
            Err(PathParseError::UnterminatedAlias(_))
        ));
        assert!(matches!(
            Path::parse("A.[Name]"),
            Err(PathParseError::MalformedAliasPair(_))
        ));
    }

    #[test]
    fn test_slice_recomputes_masks() {
        let p = Path::parse("A.*.B.*").unwrap();
        let s = p.slice(1, 4);
        assert_eq!(s.to_string(), "*.B.*");
        assert_eq!(s.wildcard_mask(), 0b101);
    }

    #[test]
    fn test_concat_and_child() {
        let a = Path::parse("A.B").unwrap();
        let b = Path::parse("*.C").unwrap();
        let c = a.concat(&b);
        assert_eq!(c.to_string(), "A.B.*.C");
        assert_eq!(c.wildcard_mask(), 0b100);

        let d = a.child(Segment::Wildcard);
        assert_eq!(d.to_string(), "A.B.*");
    }

    #[test]
    fn test_starts_with() {
        let p = Path::parse("A.B.C").unwrap();
        assert!(p.starts_with(&Path::parse("A.B").unwrap()));
        assert!(p.starts_with(&Path::root()));
        assert!(!p.starts_with(&Path::parse("A.C").unwrap()));
    }

    #[test]
    fn test_ordering_concrete_before_wildcard() {
        let concrete = Path::parse("A.B").unwrap();
        let alias = Path::parse("A.[Name=x]").unwrap();
        let wild = Path::parse("A.*").unwrap();
        assert!(concrete < alias);
        assert!(alias < wild);
        // Prefixes sort first.
        assert!(Path::parse("A").unwrap() < concrete);
    }

    #[test]
    fn test_root_name() {
        assert_eq!(Path::parse("Tags.foo").unwrap().root_name(), Some("Tags"));
        assert_eq!(Path::parse("3.foo").unwrap().root_name(), None);
        assert_eq!(Path::root().root_name(), None);
    }
}
