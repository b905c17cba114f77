use crate::error::PipelineError;
use crate::value::PropertyBag;
use glob::Pattern;
use serde::Serialize;

/// What to keep when no allow-list is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Keep every property that no deny pattern matches.
    #[default]
    KeepAll,
    /// Keep nothing; only system fields reach the feature.
    KeepNone,
}

/// Allow-list, deny globs and the fallback policy.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    allow: Vec<String>,
    deny: Vec<Pattern>,
    default_policy: DefaultPolicy,
}

impl FilterSpec {
    /// Builds a filter. Blank and duplicate allow entries are discarded
    /// (first occurrence wins); deny entries must be valid glob patterns.
    pub fn new<A, D>(allow: A, deny: D, default_policy: DefaultPolicy) -> Result<Self, PipelineError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let mut allow_keys: Vec<String> = Vec::new();
        for key in allow {
            let key = key.as_ref().trim();
            if key.is_empty() || allow_keys.iter().any(|k| k == key) {
                continue;
            }
            allow_keys.push(key.to_owned());
        }

        let mut deny_patterns = Vec::new();
        for raw in deny {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let pattern = Pattern::new(raw)
                .map_err(|e| PipelineError::Config(format!("invalid drop pattern {raw:?}: {e}")))?;
            deny_patterns.push(pattern);
        }
        deny_patterns.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        Ok(Self {
            allow: allow_keys,
            deny: deny_patterns,
            default_policy,
        })
    }

    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    /// Allow-listed keys in configured order.
    pub fn attribute_keys(&self) -> &[String] {
        &self.allow
    }

    pub fn is_denied(&self, key: &str) -> bool {
        self.deny.iter().any(|p| p.matches(key))
    }

    /// Returns the retained subset of `props`.
    pub fn apply(&self, mut props: PropertyBag) -> PropertyBag {
        if !self.allow.is_empty() {
            let mut kept = PropertyBag::new();
            for key in &self.allow {
                if self.is_denied(key) {
                    continue;
                }
                if let Some(value) = props.remove(key) {
                    kept.insert(key.clone(), value);
                }
            }
            return kept;
        }

        match self.default_policy {
            DefaultPolicy::KeepAll => {
                props.retain(|key, _| !self.is_denied(key));
                props
            }
            DefaultPolicy::KeepNone => PropertyBag::new(),
        }
    }
}
