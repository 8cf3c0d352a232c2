//! Glob-style wildcards and ordered allow/disallow groups.
//!
//! A [`Wildcard`] understands `*` (any run, including empty) and `?` (any
//! single character). A [`WildcardGroup`] holds an ordered list of allow and
//! disallow rules; the verdict for a string starts at a caller-provided
//! default and is flipped by every matching rule whose verdict differs, so
//! the last matching rule wins.

use std::fmt;

pub const MATCH_ANY: char = '*';
pub const MATCH_ONE: char = '?';

/// A compiled wildcard pattern
#[derive(Clone, PartialEq, Eq)]
pub struct Wildcard {
    spec: String,
    chars: Vec<char>,
}

impl Wildcard {
    /// Consecutive `*` are collapsed; they match the same strings.
    pub fn new(spec: &str) -> Self {
        let mut chars: Vec<char> = Vec::with_capacity(spec.len());
        for c in spec.chars() {
            if c == MATCH_ANY && chars.last() == Some(&MATCH_ANY) {
                continue;
            }
            chars.push(c);
        }
        Self {
            spec: chars.iter().collect(),
            chars,
        }
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// True if the pattern contains no wildcard characters
    pub fn is_simple(&self) -> bool {
        !self.chars.iter().any(|&c| c == MATCH_ANY || c == MATCH_ONE)
    }

    /// Iterative matcher with single-star backtracking
    pub fn matches(&self, input: &str) -> bool {
        let text: Vec<char> = input.chars().collect();
        let pattern = &self.chars;

        let (mut p, mut t) = (0usize, 0usize);
        let mut star: Option<usize> = None;
        let mut star_text = 0usize;

        while t < text.len() {
            if p < pattern.len() && (pattern[p] == MATCH_ONE || pattern[p] == text[t]) {
                p += 1;
                t += 1;
            } else if p < pattern.len() && pattern[p] == MATCH_ANY {
                star = Some(p);
                star_text = t;
                p += 1;
            } else if let Some(star_pos) = star {
                p = star_pos + 1;
                star_text += 1;
                t = star_text;
            } else {
                return false;
            }
        }
        while p < pattern.len() && pattern[p] == MATCH_ANY {
            p += 1;
        }
        p == pattern.len()
    }
}

impl fmt::Debug for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wildcard({:?})", self.spec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    wildcard: Wildcard,
    allow: bool,
}

/// Ordered sequence of allow/disallow wildcard rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WildcardGroup {
    rules: Vec<Rule>,
}

impl WildcardGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, pattern: &str) {
        self.rules.push(Rule {
            wildcard: Wildcard::new(pattern),
            allow: true,
        });
    }

    pub fn disallow(&mut self, pattern: &str) {
        self.rules.push(Rule {
            wildcard: Wildcard::new(pattern),
            allow: false,
        });
    }

    /// Evaluate the rules in insertion order starting from `default_allow`
    pub fn matches(&self, input: &str, default_allow: bool) -> bool {
        let mut allowed = default_allow;
        for rule in &self.rules {
            if rule.allow != allowed && rule.wildcard.matches(input) {
                allowed = rule.allow;
            }
        }
        allowed
    }

    /// Append all rules of `other` after ours
    pub fn append_from(&mut self, other: &WildcardGroup) {
        self.rules.extend(other.rules.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Stable textual form, e.g. `*.css+A,*.html+D,`
    pub fn signature(&self) -> String {
        self.rules
            .iter()
            .map(|rule| {
                format!(
                    "{}+{},",
                    rule.wildcard.spec(),
                    if rule.allow { "A" } else { "D" }
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_simple_patterns() {
        let w = Wildcard::new("abc");
        assert!(w.is_simple());
        assert!(w.matches("abc"));
        assert!(!w.matches("abcd"));
        assert!(!w.matches("ab"));
    }

    #[test]
    fn test_star_and_question() {
        let w = Wildcard::new("http://*.example.com/?.css");
        assert!(!w.is_simple());
        assert!(w.matches("http://www.example.com/a.css"));
        assert!(w.matches("http://a.b.example.com/z.css"));
        assert!(!w.matches("http://www.example.com/ab.css"));
        assert!(!w.matches("https://www.example.com/a.css"));

        assert!(Wildcard::new("*").matches(""));
        assert!(Wildcard::new("a*").matches("a"));
        assert!(Wildcard::new("*a*b*").matches("xxaxxbxx"));
        assert!(!Wildcard::new("*a*b*").matches("xxbxxaxx"));
    }

    #[test]
    fn test_collapses_stars() {
        assert_eq!(Wildcard::new("a***b").spec(), "a*b");
    }

    #[test]
    fn test_group_last_match_wins() {
        let mut group = WildcardGroup::new();
        group.allow("*.css");
        group.disallow("*/private/*");
        group.allow("*/private/ok.css");

        assert!(group.matches("http://x/a.css", false));
        assert!(!group.matches("http://x/private/a.css", false));
        assert!(group.matches("http://x/private/ok.css", false));
        assert!(!group.matches("http://x/a.js", false));
        assert!(group.matches("http://x/a.js", true));
        assert_eq!(
            group.signature(),
            "*.css+A,*/private/*+D,*/private/ok.css+A,"
        );
    }

    #[test]
    fn test_group_append() {
        let mut a = WildcardGroup::new();
        a.disallow("*");
        let mut b = WildcardGroup::new();
        b.allow("*.png");
        a.append_from(&b);
        assert_eq!(a.len(), 2);
        assert!(a.matches("x.png", true));
        assert!(!a.matches("x.jpg", true));
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(s in "[a-z./:]{0,20}") {
            prop_assert!(Wildcard::new(&s).matches(&s));
        }

        #[test]
        fn prop_group_equals_last_matching_rule(
            rules in proptest::collection::vec((any::<bool>(), "[ab*?]{1,4}"), 0..8),
            input in "[ab]{0,6}",
            default_allow in any::<bool>(),
        ) {
            let mut group = WildcardGroup::new();
            for (allow, pattern) in &rules {
                if *allow { group.allow(pattern) } else { group.disallow(pattern) }
            }
            let expected = rules
                .iter()
                .rev()
                .find(|(_, pattern)| Wildcard::new(pattern).matches(&input))
                .map(|(allow, _)| *allow)
                .unwrap_or(default_allow);
            prop_assert_eq!(group.matches(&input, default_allow), expected);
        }
    }
}
