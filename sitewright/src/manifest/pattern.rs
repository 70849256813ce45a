//! Target and source URL patterns.
//!
//! Patterns are pseudo-absolute URLs (rooted at the site) or scheme-carrying
//! URLs such as `part:navigation`. The final path component may hold one `*`
//! wildcard; source patterns may additionally offer `|`-separated
//! alternatives, each with at most one `*`.

use regex::Regex;

use crate::errors::ConfigError;

/// Whether a URL starts with an RFC 3986 style scheme.
fn has_scheme(url: &str) -> bool {
    let Some(colon) = url.find(':') else {
        return false;
    };
    if colon == 0 {
        return false;
    }
    let mut chars = url[..colon].chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}

/// A compiled file-name mask: `|`-separated alternatives, each holding at
/// most one `*` capture.
#[derive(Debug, Clone)]
pub struct Mask {
    alternatives: Vec<MaskAlt>,
}

#[derive(Debug, Clone)]
struct MaskAlt {
    regex: Regex,
    has_star: bool,
}

impl Mask {
    fn compile(component: &str, pattern: &str) -> Result<Self, ConfigError> {
        let mut alternatives = Vec::new();
        for alt in component.split('|') {
            if alt.is_empty() {
                return Err(ConfigError::BadPattern {
                    pattern: pattern.to_string(),
                    message: "empty mask alternative".to_string(),
                });
            }
            let stars = alt.matches('*').count();
            if stars > 1 {
                return Err(ConfigError::BadPattern {
                    pattern: pattern.to_string(),
                    message: format!("alternative '{alt}' holds more than one '*'"),
                });
            }
            let regex_src = match alt.split_once('*') {
                Some((prefix, suffix)) => {
                    format!("^{}(.*){}$", regex::escape(prefix), regex::escape(suffix))
                }
                None => format!("^{}$", regex::escape(alt)),
            };
            let regex = Regex::new(&regex_src).map_err(|err| ConfigError::BadPattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })?;
            alternatives.push(MaskAlt {
                regex,
                has_star: stars == 1,
            });
        }
        Ok(Self { alternatives })
    }

    /// Matches a file name against the mask, returning the fragment captured
    /// by `*` (empty for star-less alternatives).
    #[must_use]
    pub fn matches(&self, name: &str) -> Option<String> {
        for alt in &self.alternatives {
            if let Some(caps) = alt.regex.captures(name) {
                if alt.has_star {
                    return Some(caps.get(1).map_or_else(String::new, |m| m.as_str().to_string()));
                }
                return Some(String::new());
            }
        }
        None
    }

    /// Whether the mask matches a file name.
    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        self.matches(name).is_some()
    }
}

/// A validated target or source URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    dir: String,
    file: String,
    mask: Option<Mask>,
}

impl UrlPattern {
    /// Parses a target pattern; alternation is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadPattern`] for malformed patterns.
    pub fn target(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, false)
    }

    /// Parses a source pattern; alternation is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadPattern`] for malformed patterns.
    pub fn source(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, true)
    }

    fn parse(raw: &str, allow_alternation: bool) -> Result<Self, ConfigError> {
        let bad = |message: String| ConfigError::BadPattern {
            pattern: raw.to_string(),
            message,
        };
        if raw.is_empty() {
            return Err(bad("empty pattern".to_string()));
        }
        if raw.starts_with('/') {
            let split = raw.rfind('/').unwrap_or(0);
            let dir = if split == 0 { "/" } else { &raw[..split] };
            let file = &raw[split + 1..];
            if dir.contains('*') || dir.contains('|') {
                return Err(bad(
                    "wildcards are only supported in the final component".to_string(),
                ));
            }
            if file.is_empty() {
                return Err(bad("pattern names a directory, not a file".to_string()));
            }
            let wildcard = file.contains('*') || file.contains('|');
            if wildcard && !allow_alternation && file.contains('|') {
                return Err(bad("alternation is not allowed in targets".to_string()));
            }
            let mask = if wildcard {
                Some(Mask::compile(file, raw)?)
            } else {
                None
            };
            return Ok(Self {
                raw: raw.to_string(),
                dir: dir.to_string(),
                file: file.to_string(),
                mask,
            });
        }
        if has_scheme(raw) {
            if raw.contains('*') || raw.contains('|') {
                return Err(bad(
                    "wildcards require a pseudo-absolute URL".to_string(),
                ));
            }
            return Ok(Self {
                raw: raw.to_string(),
                dir: String::new(),
                file: raw.to_string(),
                mask: None,
            });
        }
        Err(bad(
            "pattern must be pseudo-absolute or carry a scheme".to_string(),
        ))
    }

    /// The pattern as declared.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern expands against a directory listing.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.mask.is_some()
    }

    /// The directory part, `/` for the site root, empty for scheme URLs.
    #[must_use]
    pub fn directory(&self) -> &str {
        &self.dir
    }

    /// The final path component.
    #[must_use]
    pub fn file_component(&self) -> &str {
        &self.file
    }

    /// The compiled mask of a wildcard pattern.
    #[must_use]
    pub fn mask(&self) -> Option<&Mask> {
        self.mask.as_ref()
    }

    /// Substitutes a captured fragment for the `*` in the final component.
    ///
    /// Patterns without a `*` come back unchanged, so a wildcard source may
    /// pair with a fixed target.
    #[must_use]
    pub fn instantiate(&self, fragment: &str) -> String {
        if !self.file.contains('*') {
            return self.raw.clone();
        }
        let file = self.file.replacen('*', fragment, 1);
        self.join_file(&file)
    }

    /// Builds a sibling URL in the pattern's directory.
    #[must_use]
    pub fn join_file(&self, file: &str) -> String {
        if self.dir == "/" {
            format!("/{file}")
        } else if self.dir.is_empty() {
            file.to_string()
        } else {
            format!("{}/{file}", self.dir)
        }
    }

    /// Matches a concrete URL against the pattern, returning the captured
    /// fragment on success.
    #[must_use]
    pub fn matches_url(&self, url: &str) -> Option<String> {
        match &self.mask {
            None => (url == self.raw).then(String::new),
            Some(mask) => {
                let rest = if self.dir == "/" {
                    url.strip_prefix('/')?
                } else {
                    url.strip_prefix(&self.dir)?.strip_prefix('/')?
                };
                if rest.contains('/') {
                    return None;
                }
                mask.matches(rest)
            }
        }
    }
}

impl std::fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Resolves a reference against a base URL.
///
/// Pseudo-absolute and scheme-carrying references come back unchanged;
/// relative ones resolve against the base's directory with `.` and `..`
/// segments normalized.
#[must_use]
pub fn resolve_relative(base: &str, reference: &str) -> String {
    if reference.starts_with('/') || has_scheme(reference) {
        return reference.to_string();
    }
    let dir = base.rfind('/').map_or("", |idx| &base[..idx]);
    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concrete_pattern() {
        let pattern = UrlPattern::target("/out/index.html").unwrap();
        assert!(!pattern.is_wildcard());
        assert_eq!(pattern.directory(), "/out");
        assert_eq!(pattern.file_component(), "index.html");
        assert_eq!(pattern.instantiate("x"), "/out/index.html");
        assert_eq!(pattern.matches_url("/out/index.html"), Some(String::new()));
        assert_eq!(pattern.matches_url("/out/other.html"), None);
    }

    #[test]
    fn test_wildcard_pattern_expansion() {
        let pattern = UrlPattern::target("/out/*.html").unwrap();
        assert!(pattern.is_wildcard());
        assert_eq!(pattern.instantiate("about"), "/out/about.html");
        assert_eq!(pattern.matches_url("/out/about.html"), Some("about".to_string()));
        assert_eq!(pattern.matches_url("/out/sub/a.html"), None);
    }

    #[test]
    fn test_root_directory_pattern() {
        let pattern = UrlPattern::target("/*.html").unwrap();
        assert_eq!(pattern.directory(), "/");
        assert_eq!(pattern.instantiate("index"), "/index.html");
    }

    #[test]
    fn test_source_alternation_mask() {
        let pattern = UrlPattern::source("/src/*.xml|*.dat").unwrap();
        let mask = pattern.mask().unwrap();
        assert_eq!(mask.matches("page.xml"), Some("page".to_string()));
        assert_eq!(mask.matches("blob.dat"), Some("blob".to_string()));
        assert_eq!(mask.matches("notes.txt"), None);
    }

    #[test]
    fn test_mask_without_star_matches_exactly() {
        let pattern = UrlPattern::source("/src/index.xml|extra.xml").unwrap();
        let mask = pattern.mask().unwrap();
        assert_eq!(mask.matches("index.xml"), Some(String::new()));
        assert_eq!(mask.matches("extra.xml"), Some(String::new()));
        assert!(!mask.is_match("other.xml"));
    }

    #[test]
    fn test_scheme_urls_are_concrete() {
        let pattern = UrlPattern::source("part:navigation").unwrap();
        assert!(!pattern.is_wildcard());
        assert_eq!(pattern.as_str(), "part:navigation");
        assert!(UrlPattern::source("part:*").is_err());
    }

    #[test]
    fn test_rejects_malformed_patterns() {
        assert!(UrlPattern::target("").is_err());
        assert!(UrlPattern::target("relative.html").is_err());
        assert!(UrlPattern::target("/out/").is_err());
        assert!(UrlPattern::target("/o*ut/x.html").is_err());
        assert!(UrlPattern::target("/out/a|b.html").is_err());
        assert!(UrlPattern::source("/src/a**.xml").is_err());
        assert!(UrlPattern::source("/src/a.xml||b.xml").is_err());
    }

    #[test]
    fn test_mask_escapes_regex_metacharacters() {
        let pattern = UrlPattern::source("/src/*.x+m").unwrap();
        let mask = pattern.mask().unwrap();
        assert_eq!(mask.matches("a.x+m"), Some("a".to_string()));
        assert_eq!(mask.matches("a.xxm"), None);
    }

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve_relative("/src/page.xml", "/abs.xml"), "/abs.xml");
        assert_eq!(resolve_relative("/src/page.xml", "part:nav"), "part:nav");
        assert_eq!(resolve_relative("/src/page.xml", "other.xml"), "/src/other.xml");
        assert_eq!(resolve_relative("/src/sub/page.xml", "../up.xml"), "/src/up.xml");
        assert_eq!(resolve_relative("/src/page.xml", "./same.xml"), "/src/same.xml");
    }
}
