use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::filter::NodeFilter;
use crate::tree::{TreeNode, join_position};

/// One glob mask turned into an anchored regular expression.
///
/// Masks are matched against positions relative to the synchronized root,
/// written `/a/b` for files and `/a/b/` for directories. A mask that does not
/// start with `/` is anchored at the root anyway, and a mask ending in `/`
/// covers everything below that directory.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
    include: bool,
}

impl PatternMatcher {
    pub fn include(mask: &str) -> Result<Self, MatcherError> {
        Self::new(mask, true)
    }

    pub fn exclude(mask: &str) -> Result<Self, MatcherError> {
        Self::new(mask, false)
    }

    fn new(mask: &str, include: bool) -> Result<Self, MatcherError> {
        let regex = Regex::new(&Self::to_regex(mask)).context(InvalidPatternSnafu { mask })?;
        Ok(Self {
            regex,
            include,
        })
    }

    fn to_regex(mask: &str) -> String {
        let mut mask = if mask.starts_with('/') {
            mask.to_string()
        } else {
            format!("/{mask}")
        };
        if mask.ends_with('/') {
            mask.push_str("**");
        }

        let mut regex = String::from("^");
        let mut rest = mask.as_str();
        while let Some(ch) = rest.chars().next() {
            let consumed = if rest.starts_with("/**/") {
                regex.push_str("(/|/.+/)");
                4
            } else if rest.starts_with("**") {
                regex.push_str(".*");
                2
            } else if ch == '*' {
                regex.push_str("[^/]*");
                1
            } else {
                regex.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4])));
                ch.len_utf8()
            };
            rest = &rest[consumed..];
        }
        regex.push('$');
        regex
    }

    fn matches(&self, position: &str, node: &TreeNode) -> bool {
        if node.is_leaf() || position.ends_with('/') {
            self.regex.is_match(position)
        } else {
            self.regex.is_match(&format!("{position}/"))
        }
    }

    /// Include masks accept a match or any directory holding a match.
    /// Exclude masks reject a match and accept everything else.
    pub fn accept(&self, position: &str, node: &TreeNode) -> bool {
        if !self.include {
            return !self.matches(position, node);
        }

        let mut pending = vec![(position.to_string(), node)];
        while let Some((position, node)) = pending.pop() {
            if self.matches(&position, node) {
                return true;
            }
            for child in node.children().into_iter().flat_map(|c| c.values()) {
                pending.push((join_position(&position, child.name()), child.as_ref()));
            }
        }
        false
    }
}

/// Include and exclude masks combined: at least one include must accept
/// (when any are configured) and no exclude may reject.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<PatternMatcher>,
    excludes: Vec<PatternMatcher>,
}

impl PathFilter {
    pub fn new(
        includes: impl IntoIterator<Item = impl AsRef<str>>,
        excludes: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Self, MatcherError> {
        let includes = includes
            .into_iter()
            .map(|mask| PatternMatcher::include(mask.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let excludes = excludes
            .into_iter()
            .map(|mask| PatternMatcher::exclude(mask.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { includes, excludes })
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

impl NodeFilter for PathFilter {
    fn accept(&self, position: &str, node: &TreeNode) -> bool {
        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|matcher| matcher.accept(position, node));
        included
            && self
                .excludes
                .iter()
                .all(|matcher| matcher.accept(position, node))
    }
}

#[derive(Debug, Snafu)]
pub enum MatcherError {
    #[snafu(display("Invalid pattern '{mask}'"))]
    InvalidPatternError { mask: String, source: regex::Error },
}
