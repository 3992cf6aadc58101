//! Declarative field-path redaction policy.

use std::collections::HashMap;

/// One segment of a parsed field path.
///
/// A dotted path like `spec.auth` parses to `[Field("spec"), Field("auth")]`.
/// A single `[*]` segment marks "every element of the array navigated to so
/// far" — at most one may appear per path (a second one is a parse error and
/// the whole path is dropped, since "a wrong path never throws").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Wildcard,
}

/// A single parsed, ready-to-apply field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub(crate) segments: Vec<Segment>,
}

impl PathSpec {
    /// Parse a dotted path, optionally containing a single `[*]` segment.
    ///
    /// Returns `None` for a path with more than one wildcard, or an empty
    /// path — parsing happens once at policy construction time so the hot
    /// redaction path never re-splits strings.
    pub fn parse(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        let mut wildcards = 0;
        for piece in path.split('.') {
            if piece.is_empty() {
                return None;
            }
            if piece == "[*]" {
                segments.push(Segment::Wildcard);
                wildcards += 1;
            } else {
                segments.push(Segment::Field(piece.to_string()));
            }
        }
        if wildcards > 1 {
            return None;
        }
        Some(Self { segments })
    }
}

/// Mapping from a `"group/Kind"` key to the field paths redacted for that kind.
///
/// Immutable once constructed (§5: "The Redactor is stateless except for the
/// policy, which is immutable after construction").
#[derive(Debug, Clone)]
pub struct SensitivityPolicy {
    entries: HashMap<String, Vec<PathSpec>>,
}

impl SensitivityPolicy {
    /// Build a policy from `(group/Kind, [path...])` pairs. Paths that fail
    /// to parse are silently dropped from that entry; an entry left with no
    /// valid paths is still present (empty path list), since presence alone
    /// is what marks a kind sensitive.
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(key, paths)| {
                let parsed = paths.iter().filter_map(|p| PathSpec::parse(p)).collect();
                (key, parsed)
            })
            .collect();
        Self { entries }
    }

    /// The built-in policy shipped with the core (§6).
    pub fn default_policy() -> Self {
        Self::new([
            ("/Secret".to_string(), vec!["data".to_string(), "stringData".to_string()]),
            (
                "external-secrets.io/SecretStore".to_string(),
                vec!["spec.provider".to_string(), "spec.auth".to_string()],
            ),
            (
                "external-secrets.io/ClusterSecretStore".to_string(),
                vec!["spec.provider".to_string(), "spec.auth".to_string()],
            ),
            (
                "bitnami.com/SealedSecret".to_string(),
                vec!["spec.encryptedData".to_string()],
            ),
            (
                "cert-manager.io/Certificate".to_string(),
                vec!["spec.privateKey".to_string(), "spec.keystores".to_string()],
            ),
        ])
    }

    /// Is this `group/Kind` key configured at all (even with zero valid paths)?
    pub fn is_sensitive(&self, policy_key: &str) -> bool {
        self.entries.contains_key(policy_key)
    }

    pub fn paths_for(&self, policy_key: &str) -> Option<&[PathSpec]> {
        self.entries.get(policy_key).map(Vec::as_slice)
    }
}
