//! Namespace patterns with `*` wildcards, used to include, exclude and rename namespaces.

use crate::error::{RestoreError, Result};
use regex::Regex;

/// A compiled `db.coll` pattern, `*` matches any run of characters (dots included).
#[derive(Debug, Clone)]
pub struct NsPattern {
    pattern: String,
    regex: Regex,
}

impl NsPattern {
    /// compile `pattern`.
    pub fn new(pattern: &str) -> Result<NsPattern> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("(.*?)");
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| {
            RestoreError::ConfigError(format!("invalid namespace pattern {:?}: {}", pattern, e))
        })?;
        Ok(NsPattern {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// true if `ns` matches.
    pub fn is_match(&self, ns: &str) -> bool {
        self.regex.is_match(ns)
    }

    /// Text matched by every `*` of this pattern, None if `ns` doesn't match.
    pub fn captures(&self, ns: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(ns)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }

    /// how many `*` this pattern has.
    pub fn wildcards(&self) -> usize {
        self.regex.captures_len() - 1
    }

    /// the source pattern.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Rename rule: namespaces matching `from` are restored into `to`, where each `*` of `to`
/// is replaced by the text matched by the corresponding `*` of `from`.
#[derive(Debug, Clone)]
pub struct NsRenamer {
    rules: Vec<(NsPattern, String)>,
}

impl NsRenamer {
    /// Compile `(from, to)` pairs, both sides must have the same number of `*`.
    pub fn new(pairs: &[(String, String)]) -> Result<NsRenamer> {
        let mut rules = Vec::with_capacity(pairs.len());
        for (from, to) in pairs {
            let pattern = NsPattern::new(from)?;
            let to_wildcards = to.matches('*').count();
            if pattern.wildcards() != to_wildcards {
                return Err(RestoreError::ConfigError(format!(
                    "rename from {:?} to {:?}: both sides must have the same number of '*'",
                    from, to
                )));
            }
            rules.push((pattern, to.clone()));
        }
        Ok(NsRenamer { rules })
    }

    /// New name of `ns`, the first matching rule wins.  `ns` itself when nothing matches.
    pub fn rename(&self, ns: &str) -> String {
        for (pattern, to) in self.rules.iter() {
            if let Some(captures) = pattern.captures(ns) {
                let mut renamed = String::with_capacity(to.len());
                let mut captures = captures.into_iter();
                for (idx, part) in to.split('*').enumerate() {
                    if idx > 0 {
                        renamed.push_str(&captures.next().unwrap_or_default());
                    }
                    renamed.push_str(part);
                }
                return renamed;
            }
        }
        ns.to_string()
    }

    /// true if there is no rule.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Include and exclude filters.
///
/// With no include pattern everything is included, an exclude match always wins.
#[derive(Debug, Clone, Default)]
pub struct NsFilter {
    include: Vec<NsPattern>,
    exclude: Vec<NsPattern>,
}

impl NsFilter {
    /// compile include and exclude patterns.
    pub fn new(include: &[String], exclude: &[String]) -> Result<NsFilter> {
        Ok(NsFilter {
            include: include.iter().map(|p| NsPattern::new(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| NsPattern::new(p)).collect::<Result<_>>()?,
        })
    }

    /// true if `ns` passes the filters.
    pub fn is_selected(&self, ns: &str) -> bool {
        if self.exclude.iter().any(|p| p.is_match(ns)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.is_match(ns))
    }
}
