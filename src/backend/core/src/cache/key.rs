//! Cache key convention.
//!
//! Every key has exactly five colon-delimited segments:
//!
//! ```text
//! {namespace}:{version}:{resource}:{tenant}:{identifier}
//! vsa:v1:user::123          (no tenant)
//! vsa:v1:user:acme:123      (tenant "acme")
//! ```
//!
//! The identifier is the last segment and may itself contain `:`. The other
//! segments may not contain `:` or any glob metacharacter, so a pattern built
//! from them can only match what it names. Patterns replace the tail with `*`
//! and are only ever used for bulk invalidation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::CacheSettings;
use crate::error::{CacheError, ErrorCode, Result};

const SEGMENTS: usize = 5;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Key
// ═══════════════════════════════════════════════════════════════════════════════

/// A well-formed five-segment cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a raw key, returning `None` if it is not well formed.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.splitn(SEGMENTS, ':').collect();
        if parts.len() != SEGMENTS {
            return None;
        }
        let (namespace, version, resource, tenant, identifier) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);

        if !is_plain_segment(namespace) || !is_plain_segment(version) {
            return None;
        }
        if !is_plain_segment(resource) || identifier.is_empty() {
            return None;
        }
        if !tenant.is_empty() && !is_plain_segment(tenant) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segment(&self, index: usize) -> &str {
        self.0.splitn(SEGMENTS, ':').nth(index).unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.segment(0)
    }

    pub fn version(&self) -> &str {
        self.segment(1)
    }

    pub fn resource(&self) -> &str {
        self.segment(2)
    }

    /// The tenant segment, `None` when the key is not tenant-scoped.
    pub fn tenant(&self) -> Option<&str> {
        Some(self.segment(3)).filter(|t| !t.is_empty())
    }

    pub fn identifier(&self) -> &str {
        self.segment(4)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(raw: String) -> Result<Self> {
        CacheKey::parse(&raw).ok_or_else(|| {
            CacheError::with_internal(ErrorCode::InvalidKey, "Malformed cache key", raw)
        })
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Pattern
// ═══════════════════════════════════════════════════════════════════════════════

/// A glob over cache keys: `*` matches any run, `?` one character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CachePattern(String);

impl CachePattern {
    /// Accept any non-blank glob. Used by admin tooling for ad-hoc patterns.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `key` falls under this pattern.
    pub fn matches(&self, key: &str) -> bool {
        glob_matches(&self.0, key)
    }
}

impl fmt::Display for CachePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CachePattern {
    type Error = CacheError;

    fn try_from(raw: String) -> Result<Self> {
        CachePattern::parse(&raw).ok_or_else(|| {
            CacheError::new(ErrorCode::InvalidPattern, "Cache pattern must not be blank")
        })
    }
}

impl From<CachePattern> for String {
    fn from(pattern: CachePattern) -> Self {
        pattern.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Convention
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds and parses keys for one namespace and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConvention {
    namespace: String,
    version: String,
}

impl KeyConvention {
    pub fn new(namespace: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let version = version.into();
        if !is_plain_segment(&namespace) || !is_plain_segment(&version) {
            return Err(CacheError::invalid_configuration(format!(
                "key namespace {:?} and version {:?} must be non-empty without any of {:?}",
                namespace, version, RESERVED_SEGMENT_CHARS
            )));
        }
        Ok(Self { namespace, version })
    }

    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        Self::new(settings.namespace.clone(), settings.version.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Build a key. `None` tenant and `Some("")` produce the same key.
    ///
    /// Returns `None` for an empty resource or identifier, or a resource or
    /// tenant containing `:` or a glob metacharacter.
    pub fn build(&self, resource: &str, identifier: &str, tenant: Option<&str>) -> Option<CacheKey> {
        let tenant = tenant.unwrap_or_default();
        if !is_plain_segment(resource) || identifier.is_empty() {
            return None;
        }
        if !tenant.is_empty() && !is_plain_segment(tenant) {
            return None;
        }
        Some(CacheKey(format!(
            "{}:{}:{}:{}:{}",
            self.namespace, self.version, resource, tenant, identifier
        )))
    }

    /// Pattern covering every key of a resource across all tenants.
    pub fn build_pattern(&self, resource: &str) -> Option<CachePattern> {
        if !is_plain_segment(resource) {
            return None;
        }
        Some(CachePattern(format!(
            "{}:{}:{}:*",
            self.namespace, self.version, resource
        )))
    }

    /// Pattern covering every key of a resource within one tenant.
    pub fn build_tenant_pattern(&self, resource: &str, tenant: &str) -> Option<CachePattern> {
        if !is_plain_segment(resource) || !is_plain_segment(tenant) {
            return None;
        }
        Some(CachePattern(format!(
            "{}:{}:{}:{}:*",
            self.namespace, self.version, resource, tenant
        )))
    }

    /// Pattern covering every key this convention produces.
    pub fn namespace_pattern(&self) -> CachePattern {
        CachePattern(format!("{}:{}:*", self.namespace, self.version))
    }

    /// Extract the resource segment of a raw key.
    pub fn parse_resource(&self, raw: &str) -> Option<String> {
        CacheKey::parse(raw).map(|key| key.resource().to_string())
    }

    /// Extract the identifier segment of a raw key.
    pub fn parse_identifier(&self, raw: &str) -> Option<String> {
        CacheKey::parse(raw).map(|key| key.identifier().to_string())
    }

    /// Whether a key was produced under this namespace and version.
    pub fn owns(&self, key: &CacheKey) -> bool {
        key.namespace() == self.namespace && key.version() == self.version
    }
}

/// Characters a non-identifier segment may not contain.
pub(crate) const RESERVED_SEGMENT_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

pub(crate) fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(RESERVED_SEGMENT_CHARS)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Glob Matching
// ═══════════════════════════════════════════════════════════════════════════════

/// Convert a glob pattern to an anchored regex pattern.
pub fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() * 2);
    regex.push('^');

    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }

    regex.push('$');
    regex
}

/// Match `text` against a glob.
pub fn glob_matches(glob: &str, text: &str) -> bool {
    regex::Regex::new(&glob_to_regex(glob))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
