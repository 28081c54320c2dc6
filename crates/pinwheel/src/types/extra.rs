// Implementation comes from https://github.com/njsmith/posy/blob/main/src/vocab/extra.rs
// Licensed under MIT or Apache-2.0

// 'Extra' string format is not well specified. It looks like what pip does is
// run things through pkg_resources.safe_extra, which lowercases and collapses
// runs of non-alphanumeric characters. PEP 508's grammar says extras are
// "identifiers", but in practice PyPI metadata contains far stranger strings.
// We pretend extras normalize exactly like package names and see how long we
// can get away with it.

use miette::Diagnostic;
use serde::{Serialize, Serializer};
use serde_with::DeserializeFromStr;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Eq, DeserializeFromStr)]
/// Structure that holds both the source string and the normalized version of an extra.
pub struct Extra {
    /// The original string this instance was created from
    source: Box<str>,

    /// The normalized version of `source`.
    normalized: Box<str>,
}

impl Extra {
    /// Returns the source representation of the name. This is the string from which this
    /// instance was created.
    pub fn as_source_str(&self) -> &str {
        self.source.as_ref()
    }

    /// Returns the normalized version of the name.
    pub fn as_str(&self) -> &str {
        self.normalized.as_ref()
    }
}

/// An error that can occur when parsing an extra identifier.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParseExtraError {}

impl FromStr for Extra {
    type Err = ParseExtraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Extras normalize exactly like package names.
        Ok(Self {
            source: s.to_owned().into_boxed_str(),
            normalized: super::package_name::normalize(s).into_boxed_str(),
        })
    }
}

impl Display for Extra {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalized)
    }
}

impl Hash for Extra {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state)
    }
}

impl PartialEq for Extra {
    fn eq(&self, other: &Self) -> bool {
        self.normalized.eq(&other.normalized)
    }
}

impl PartialOrd for Extra {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Extra {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Serialize for Extra {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.source.as_ref().serialize(serializer)
    }
}
