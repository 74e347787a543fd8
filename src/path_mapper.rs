//! Identifier to storage path mapping.
//!
//! Stores keep millions of objects, and a flat namespace is unkind to both
//! filesystems and object-store listings. A `PathMapper` rewrites an
//! identifier into a nested path with a regex and a replacement template:
//!
//! ```
//! use image_store::PathMapper;
//!
//! let mapper = PathMapper::new(r"^([0-9a-f]{2})(.*)$", "${1}/${1}${2}");
//! assert_eq!(mapper.map("ab1234cdef"), "ab/ab1234cdef");
//! ```

use regex::Regex;

/// Rewrites identifiers into storage paths.
///
/// Mapping is total: an empty pattern, a pattern that fails to compile, or
/// a pattern that does not match the identifier all yield the identifier
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    rule: Option<Rule>,
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    template: String,
}

impl PathMapper {
    /// Build a mapper from a pattern and a replacement template.
    ///
    /// The template uses the `regex` crate's expansion syntax (`$1`, `${1}`,
    /// `${name}`, `$$` for a literal dollar sign).
    pub fn new(pattern: &str, template: &str) -> Self {
        if pattern.is_empty() || template.is_empty() {
            return Self::identity();
        }

        match Regex::new(pattern) {
            Ok(regex) => Self {
                rule: Some(Rule {
                    regex,
                    template: template.to_string(),
                }),
            },
            Err(e) => {
                tracing::warn!(
                    pattern,
                    error = %e,
                    "Invalid name path pattern, falling back to identity mapping"
                );
                Self::identity()
            }
        }
    }

    pub fn identity() -> Self {
        Self { rule: None }
    }

    pub fn is_identity(&self) -> bool {
        self.rule.is_none()
    }

    /// Map an identifier to its relative storage path.
    pub fn map(&self, name: &str) -> String {
        let Some(rule) = &self.rule else {
            return name.to_string();
        };

        if !rule.regex.is_match(name) {
            return name.to_string();
        }

        let mapped = rule.regex.replace(name, rule.template.as_str());
        let trimmed = mapped.trim_start_matches('/');
        if trimmed.is_empty() {
            name.to_string()
        } else {
            trimmed.to_string()
        }
    }
}
