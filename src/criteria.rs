use crate::{
    error::{ParseError, ReloadError, ValidationError},
    k8s::{self, MetadataKey},
};
use regex::Regex;
use std::{collections::BTreeMap, convert::TryFrom, fmt};

/// The ordered set of selection criteria currently in effect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Policy {
    pub services: Vec<Criterion>,
}

/// One rule selecting workloads by metadata and label patterns.
///
/// Every constraint must hold for a workload to be selected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Criterion {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub metadata: BTreeMap<String, RegexPattern>,
    pub pod_labels: BTreeMap<String, RegexPattern>,
}

/// A compiled regular expression that remembers its source text.
///
/// The unset pattern matches any value, including the empty string. Two
/// patterns are equal when their source text is equal.
#[derive(Clone, Default)]
pub struct RegexPattern(Option<Regex>);

// === impl Policy ===

impl Policy {
    /// Parses a YAML policy document without validating it.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let doc = k8s::PolicyDocument::from_yaml(text)?;
        Self::try_from(doc)
    }

    /// Parses and validates a YAML policy document.
    pub fn load(text: &str) -> Result<Self, ReloadError> {
        let policy = Self::parse(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// An empty policy is valid. Each criterion must define at least one
    /// constraint and may only use recognized metadata keys.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (index, criterion) in self.services.iter().enumerate() {
            if criterion.metadata.is_empty() && criterion.pod_labels.is_empty() {
                return Err(ValidationError::NoSelector { index });
            }
            for key in criterion.metadata.keys() {
                if key.parse::<MetadataKey>().is_err() {
                    return Err(ValidationError::UnknownAttribute {
                        index,
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl TryFrom<k8s::PolicyDocument> for Policy {
    type Error = ParseError;

    fn try_from(doc: k8s::PolicyDocument) -> Result<Self, Self::Error> {
        let services = doc
            .discovery
            .services
            .into_iter()
            .map(Criterion::try_from)
            .collect::<Result<_, _>>()?;
        Ok(Self { services })
    }
}

// === impl Criterion ===

impl Criterion {
    pub fn get(&self, key: MetadataKey) -> Option<&RegexPattern> {
        self.metadata.get(key.as_str())
    }

    /// Iterates over the recognized metadata constraints.
    pub fn metadata_keys(&self) -> impl Iterator<Item = (MetadataKey, &RegexPattern)> + '_ {
        self.metadata
            .iter()
            .filter_map(|(k, pattern)| Some((k.parse().ok()?, pattern)))
    }

    /// A human-readable label for logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

impl TryFrom<k8s::ServiceSelector> for Criterion {
    type Error = ParseError;

    fn try_from(svc: k8s::ServiceSelector) -> Result<Self, Self::Error> {
        let metadata = compile_all(svc.metadata)?;
        let pod_labels = compile_all(svc.k8s_pod_labels.unwrap_or_default())?;
        // An empty name is the same as no name.
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        Ok(Self {
            name: non_empty(svc.name),
            namespace: non_empty(svc.namespace),
            metadata,
            pod_labels,
        })
    }
}

fn compile_all(
    patterns: k8s::policy::Patterns,
) -> Result<BTreeMap<String, RegexPattern>, ParseError> {
    patterns
        .into_iter()
        .map(|(key, pattern)| {
            let pattern = pattern.0.unwrap_or_default();
            match RegexPattern::new(&pattern) {
                Ok(re) => Ok((key, re)),
                Err(source) => Err(ParseError::Regex {
                    key,
                    pattern,
                    source,
                }),
            }
        })
        .collect()
}

// === impl RegexPattern ===

impl RegexPattern {
    /// Compiles `pattern`. An empty pattern is unset.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.is_empty() {
            return Ok(Self(None));
        }
        Regex::new(pattern).map(|re| Self(Some(re)))
    }

    pub fn unset() -> Self {
        Self(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// The pattern's source text; empty when unset.
    pub fn as_str(&self) -> &str {
        self.0.as_ref().map(Regex::as_str).unwrap_or("")
    }

    /// Matches anywhere in `value` unless the pattern is anchored.
    pub fn is_match(&self, value: &str) -> bool {
        match self.0 {
            None => true,
            Some(ref re) => re.is_match(value),
        }
    }

    /// Returns the literal name this pattern selects, if it is an anchored
    /// literal like `^name$`.
    ///
    /// Only such patterns can be expressed as an exact-name field selector.
    pub fn exact_name(&self) -> Option<&str> {
        let literal = self
            .as_str()
            .strip_prefix('^')
            .and_then(|s| s.strip_suffix('$'))?;
        let is_name = |c: char| c.is_ascii_alphanumeric() || c == '-';
        if literal.is_empty() || !literal.chars().all(is_name) {
            return None;
        }
        Some(literal)
    }
}

impl PartialEq for RegexPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for RegexPattern {}

impl fmt::Debug for RegexPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("RegexPattern(<unset>)"),
            Some(ref re) => write!(f, "RegexPattern({:?})", re.as_str()),
        }
    }
}

impl fmt::Display for RegexPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
