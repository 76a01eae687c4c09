//! Path patterns decide which middleware applies to a request path.
//!
//! Patterns and paths are normalized the same way before comparison:
//! leading/trailing separators are stripped and the remainder is split into
//! segments, discarding empty ones. Matching is pure and deterministic.

use crate::error::Error;

const SINGLE_TOKEN: &str = "*";
const MULTI_TOKEN: &str = "**";

/// A rule scoping middleware to request paths.
///
/// The variant set is closed on purpose: every matcher is exhaustively
/// handled and new syntax means a new variant, not a subclass.
#[derive(Clone, Debug)]
pub enum PathPattern {
    /// Matches when the pattern segment equals any one segment of the path.
    /// The separator alone (`/`) is the universal marker and matches every
    /// path; this keeps the legacy "global" registration convention working.
    Contains(String),
    /// Whole-path equality after normalization.
    Exact(String),
    /// Segment-wise equality where `*` consumes exactly one segment.
    /// Segment counts must match; `*` is never "zero or more".
    SingleWildcard(String),
    /// Glob matching where `**` consumes zero or more whole segments,
    /// composable with `*` and literal segments in any position.
    MultiWildcard(String),
    /// Compiled regular expression applied to the raw path string.
    Regex(regex::Regex),
}

impl PathPattern {
    pub fn contains(pattern: impl Into<String>) -> Self {
        Self::Contains(pattern.into())
    }

    pub fn exact(pattern: impl Into<String>) -> Self {
        Self::Exact(pattern.into())
    }

    pub fn single_wildcard(pattern: impl Into<String>) -> Self {
        Self::SingleWildcard(pattern.into())
    }

    pub fn multi_wildcard(pattern: impl Into<String>) -> Self {
        Self::MultiWildcard(pattern.into())
    }

    /// Compiles the expression up front; an invalid pattern fails here, never
    /// at match time.
    pub fn regex(pattern: &str) -> Result<Self, Error> {
        let compiled = regex::Regex::new(pattern).map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self::Regex(compiled))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Contains(pattern) => contains_match(pattern, path),
            Self::Exact(pattern) => normalize(pattern) == normalize(path),
            Self::SingleWildcard(pattern) => {
                single_wildcard_match(&segments(pattern), &segments(path))
            }
            Self::MultiWildcard(pattern) => glob_match(&segments(pattern), &segments(path)),
            Self::Regex(matcher) => matcher.is_match(path),
        }
    }

    /// Whether this pattern provably matches every path. Used to partition
    /// the registry into global and path-scoped groups; patterns that happen
    /// to match everything without being provable here (e.g. regex `.*`)
    /// simply land in the scoped group with identical behavior.
    pub(crate) fn matches_all_paths(&self) -> bool {
        match self {
            Self::Contains(pattern) => normalize(pattern).is_empty(),
            Self::MultiWildcard(pattern) => {
                let parts = segments(pattern);
                !parts.is_empty() && parts.iter().all(|part| *part == MULTI_TOKEN)
            }
            _ => false,
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn segments(path: &str) -> Vec<&str> {
    normalize(path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn contains_match(pattern: &str, path: &str) -> bool {
    let needle = normalize(pattern);
    if needle.is_empty() {
        return true;
    }
    segments(path).iter().any(|segment| *segment == needle)
}

fn single_wildcard_match(pattern: &[&str], path: &[&str]) -> bool {
    pattern.len() == path.len()
        && pattern
            .iter()
            .zip(path)
            .all(|(wanted, found)| *wanted == SINGLE_TOKEN || wanted == found)
}

struct ResumePoint {
    pattern: usize,
    path: usize,
}

/// Iterative glob matcher with an explicit backtracking stack.
///
/// Each `**` records a resume point before first trying to consume zero
/// segments. On a local mismatch the most recent resume point is advanced to
/// consume one additional path segment and the scan retries from there; the
/// match fails once no resume point remains. Worst case is quadratic in path
/// length for adversarial multi-token patterns, which expected pattern sizes
/// keep harmless; the property test below leans on that bound.
fn glob_match(pattern: &[&str], path: &[&str]) -> bool {
    let mut resume: Vec<ResumePoint> = Vec::new();
    let mut pattern_index = 0;
    let mut path_index = 0;
    loop {
        if pattern_index == pattern.len() && path_index == path.len() {
            return true;
        }
        if pattern_index < pattern.len() {
            let token = pattern[pattern_index];
            if token == MULTI_TOKEN {
                // A trailing multi token swallows every remaining segment.
                if pattern_index + 1 == pattern.len() {
                    return true;
                }
                resume.push(ResumePoint {
                    pattern: pattern_index + 1,
                    path: path_index,
                });
                pattern_index += 1;
                continue;
            }
            if path_index < path.len() && (token == SINGLE_TOKEN || token == path[path_index]) {
                pattern_index += 1;
                path_index += 1;
                continue;
            }
        }
        // Local mismatch: the most recent resume point consumes one more
        // path segment; exhausted points are discarded.
        loop {
            let Some(point) = resume.last_mut() else {
                return false;
            };
            if point.path < path.len() {
                point.path += 1;
                pattern_index = point.pattern;
                path_index = point.path;
                break;
            }
            resume.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::{PathPattern, glob_match, segments};

    #[test]
    fn contains_universal_marker_matches_everything() {
        let pattern = PathPattern::contains("/");
        assert!(pattern.matches("/users/123"));
        assert!(pattern.matches(""));
        assert!(pattern.matches("/"));
    }

    #[test]
    fn contains_matches_segment_in_any_position() {
        let pattern = PathPattern::contains("items");
        assert!(pattern.matches("/items"));
        assert!(pattern.matches("/v1/items/9"));
        assert!(!pattern.matches("/v1/item/9"));
        assert!(!pattern.matches("/v1/itemsets"));
    }

    #[test]
    fn exact_ignores_edge_separators() {
        let pattern = PathPattern::exact("/users/");
        assert!(pattern.matches("users"));
        assert!(!pattern.matches("/users/123"));
    }

    #[test]
    fn exact_root_matches_root() {
        let pattern = PathPattern::exact("/");
        assert!(pattern.matches(""));
        assert!(pattern.matches("/"));
        assert!(!pattern.matches("/users"));
    }

    #[test]
    fn single_wildcard_requires_equal_segment_counts() {
        let pattern = PathPattern::single_wildcard("/users/*");
        assert!(pattern.matches("/users/123"));
        assert!(!pattern.matches("/users/123/posts"));
        assert!(!pattern.matches("/users"));

        let pattern = PathPattern::single_wildcard("/*/items/*");
        assert!(pattern.matches("/orders/items/9"));
        assert!(!pattern.matches("/orders/items"));
    }

    #[test]
    fn multi_wildcard_consumes_zero_or_more_segments() {
        let pattern = PathPattern::multi_wildcard("/api/**");
        assert!(pattern.matches("/api"));
        assert!(pattern.matches("/api/v1/users/1"));

        let pattern = PathPattern::multi_wildcard("/api/**/details");
        assert!(pattern.matches("/api/details"));
        assert!(pattern.matches("/api/v1/users/1/details"));
        assert!(!pattern.matches("/api/v1/summary"));

        let pattern = PathPattern::multi_wildcard("**/users");
        assert!(pattern.matches("/a/b/users"));
        assert!(pattern.matches("/users"));
        assert!(!pattern.matches("/a/b/users/1"));
    }

    #[test]
    fn multi_wildcard_composes_with_single_wildcard() {
        let pattern = PathPattern::multi_wildcard("/api/*/files/**/meta");
        assert!(pattern.matches("/api/v2/files/meta"));
        assert!(pattern.matches("/api/v2/files/a/b/c/meta"));
        assert!(!pattern.matches("/api/files/a/meta"));
    }

    #[test]
    fn multi_wildcard_never_matches_partial_segments() {
        let pattern = PathPattern::multi_wildcard("/api/**/user");
        assert!(!pattern.matches("/api/users"));
    }

    #[test]
    fn regex_applies_to_raw_path() {
        let pattern = PathPattern::regex(r"^/v\d+/users/\d+$").expect("pattern should compile");
        assert!(pattern.matches("/v1/users/42"));
        assert!(!pattern.matches("v1/users/42"));
    }

    #[test]
    fn regex_construction_fails_on_invalid_pattern() {
        let error = PathPattern::regex("(unclosed").expect_err("invalid regex should fail");
        assert_eq!(error.code(), crate::error::ErrorCode::InvalidPattern);
    }

    #[test]
    fn matching_is_deterministic() {
        let pattern = PathPattern::multi_wildcard("/a/**/b/*/c");
        let path = "/a/x/y/b/z/c";
        let first = pattern.matches(path);
        for _ in 0..64 {
            assert_eq!(pattern.matches(path), first);
        }
    }

    /// Reference matcher: straightforward recursion over the same segment
    /// alphabet, used only to cross-check the iterative implementation.
    fn reference_match(pattern: &[&str], path: &[&str]) -> bool {
        let Some((head, rest)) = pattern.split_first() else {
            return path.is_empty();
        };
        if *head == "**" {
            return (0..=path.len()).any(|skip| reference_match(rest, &path[skip..]));
        }
        match path.split_first() {
            Some((segment, path_rest)) => {
                (*head == "*" || head == segment) && reference_match(rest, path_rest)
            }
            None => false,
        }
    }

    #[test]
    fn glob_agrees_with_reference_on_adversarial_inputs() {
        let alphabet = ["a", "b", "*", "**"];
        let mut rng = StdRng::seed_from_u64(0x9e3779b97f4a7c15);
        for _ in 0..2000 {
            let pattern_len = rng.random_range(0..8);
            let path_len = rng.random_range(0..10);
            let pattern: Vec<&str> = (0..pattern_len)
                .map(|_| alphabet[rng.random_range(0..alphabet.len())])
                .collect();
            let path: Vec<&str> = (0..path_len)
                .map(|_| if rng.random_range(0..2) == 0 { "a" } else { "b" })
                .collect();
            assert_eq!(
                glob_match(&pattern, &path),
                reference_match(&pattern, &path),
                "pattern={pattern:?} path={path:?}"
            );
        }
    }

    #[test]
    fn many_multi_tokens_terminate_on_non_matching_path() {
        let pattern_text = format!("{}/z", "**/".repeat(16));
        let pattern = segments(&pattern_text);
        let path_text = "/a".repeat(24);
        let path = segments(&path_text);
        assert!(!glob_match(&pattern, &path));
    }
}
