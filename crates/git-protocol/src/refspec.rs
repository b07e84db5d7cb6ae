//! Refspec parsing, matching, and expansion.
//!
//! A refspec maps between remote and local ref namespaces:
//! `+refs/heads/*:refs/remotes/origin/*`. A leading `+` forces the
//! update. A pattern refspec carries exactly one `*` on each side; the
//! matched middle substitutes into the destination. An empty destination
//! means "fetch but don't store"; an empty source means "delete the
//! destination".

use bstr::{BStr, BString, ByteSlice};

use crate::ProtocolError;

/// A parsed refspec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSpec {
    pub force: bool,
    pub pattern: bool,
    pub src: String,
    pub dst: String,
}

impl RefSpec {
    /// Parse a refspec string.
    pub fn parse(spec: &str) -> Result<Self, ProtocolError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProtocolError::InvalidRefSpec("empty refspec".into()));
        }

        let (force, rest) = match spec.strip_prefix('+') {
            Some(s) => (true, s),
            None => (false, spec),
        };

        let (src, dst) = match rest.find(':') {
            Some(colon) => (&rest[..colon], &rest[colon + 1..]),
            None => (rest, ""),
        };

        let src_stars = src.matches('*').count();
        let dst_stars = dst.matches('*').count();
        let pattern = src_stars > 0 || dst_stars > 0;

        if pattern {
            // Both sides carry exactly one *, unless one side is empty
            if src_stars > 1 || dst_stars > 1 {
                return Err(ProtocolError::InvalidRefSpec(format!(
                    "multiple wildcards in refspec: {}",
                    spec
                )));
            }
            if !src.is_empty() && !dst.is_empty() && src_stars != dst_stars {
                return Err(ProtocolError::InvalidRefSpec(format!(
                    "wildcard on only one side of refspec: {}",
                    spec
                )));
            }
        }

        if src.is_empty() && dst.is_empty() {
            return Err(ProtocolError::InvalidRefSpec(format!(
                "refspec with neither source nor destination: {}",
                spec
            )));
        }

        Ok(RefSpec {
            force,
            pattern,
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Parse several refspec strings.
    pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Self>, ProtocolError> {
        specs.iter().map(|s| RefSpec::parse(s.as_ref())).collect()
    }

    /// A deletion refspec (`:refs/heads/topic`).
    pub fn is_delete(&self) -> bool {
        self.src.is_empty() && !self.dst.is_empty()
    }

    /// Whether `name` matches the source side.
    pub fn matches_src(&self, name: &BStr) -> bool {
        pattern_match(self.src.as_bytes(), name).is_some()
    }

    /// Map a name matching the source side onto the destination side.
    ///
    /// `None` when the name does not match or the destination is empty
    /// (fetch-only).
    pub fn expand_dst(&self, name: &BStr) -> Option<BString> {
        let middle = pattern_match(self.src.as_bytes(), name)?;
        if self.dst.is_empty() {
            return None;
        }
        Some(substitute(self.dst.as_bytes(), middle))
    }

    /// Whether `name` matches the destination side.
    pub fn matches_dst(&self, name: &BStr) -> bool {
        !self.dst.is_empty() && pattern_match(self.dst.as_bytes(), name).is_some()
    }

    /// Map a destination name back onto the source side (tracking-ref
    /// maintenance after a push).
    pub fn expand_src(&self, dst_name: &BStr) -> Option<BString> {
        let middle = pattern_match(self.dst.as_bytes(), dst_name)?;
        if self.src.is_empty() {
            return None;
        }
        Some(substitute(self.src.as_bytes(), middle))
    }
}

impl std::fmt::Display for RefSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.force {
            write!(f, "+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}

/// Match `name` against a pattern with at most one `*`; returns the
/// matched middle (empty for exact matches).
fn pattern_match<'a>(pattern: &[u8], name: &'a BStr) -> Option<&'a [u8]> {
    match pattern.find_byte(b'*') {
        Some(star) => {
            let prefix = &pattern[..star];
            let suffix = &pattern[star + 1..];
            if name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
            {
                Some(&name[prefix.len()..name.len() - suffix.len()])
            } else {
                None
            }
        }
        None => {
            if pattern == name.as_bytes() {
                Some(&[])
            } else {
                None
            }
        }
    }
}

fn substitute(pattern: &[u8], middle: &[u8]) -> BString {
    match pattern.find_byte(b'*') {
        Some(star) => {
            let mut out = BString::from(&pattern[..star]);
            out.extend_from_slice(middle);
            out.extend_from_slice(&pattern[star + 1..]);
            out
        }
        None => BString::from(pattern),
    }
}

/// The implied refspec for `push --tags`.
pub fn tags_refspec() -> RefSpec {
    RefSpec::parse("refs/tags/*:refs/tags/*").expect("static refspec")
}

/// The implied refspec for `push --all`.
pub fn all_branches_refspec() -> RefSpec {
    RefSpec::parse("refs/heads/*:refs/heads/*").expect("static refspec")
}

/// The implied refspec for `push --mirror` (force; deletions are added
/// by the push driver for remote refs with no local counterpart).
pub fn mirror_refspec() -> RefSpec {
    RefSpec::parse("+refs/*:refs/*").expect("static refspec")
}

/// First-match-wins expansion of a remote name through a refspec list,
/// as used for fetch.
pub fn map_remote_to_local<'a>(
    refspecs: &'a [RefSpec],
    name: &BStr,
) -> Option<(&'a RefSpec, Option<BString>)> {
    for spec in refspecs {
        if spec.is_delete() {
            continue;
        }
        if spec.matches_src(name) {
            return Some((spec, spec.expand_dst(name)));
        }
    }
    None
}
