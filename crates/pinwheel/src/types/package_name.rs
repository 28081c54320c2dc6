use miette::Diagnostic;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// A python package name as it appears in metadata, filenames or user input. The original
/// spelling is kept for display next to the canonical form; everything that decides identity
/// (equality, ordering, hashing) happens on the canonical form.
#[derive(Debug, Clone, Eq)]
pub struct PackageName {
    /// The original string this instance was created from
    source: Box<str>,

    /// The canonical form of `source`.
    normalized: NormalizedPackageName,
}

/// The canonical form of a package name as described in
/// [PEP 503](https://www.python.org/dev/peps/pep-0503/#normalized-names): lowercased, with every
/// run of `-`, `_` and `.` collapsed to a single `-`. This is the form the resolver keys its
/// state by.
#[repr(transparent)]
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NormalizedPackageName(Box<str>);

/// Error when parsing a package name
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParsePackageNameError {
    /// The input was empty.
    #[error("package name cannot be empty")]
    Empty,

    /// The input contains a character outside `[A-Za-z0-9._-]`.
    #[error("package name '{0}' contains the invalid character {1:?}")]
    InvalidCharacter(String, char),

    /// The input starts or ends with a separator.
    #[error("package name '{0}' must start and end with a letter or a digit")]
    NonAlphanumericBoundary(String),
}

/// Checks the shape required by the
/// [core metadata spec](https://packaging.python.org/specifications/core-metadata/#name): ascii
/// letters and digits, with `.`, `-` and `_` allowed everywhere but the boundaries.
fn validate(s: &str) -> Result<(), ParsePackageNameError> {
    if s.is_empty() {
        return Err(ParsePackageNameError::Empty);
    }
    if let Some(invalid) = s
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(ParsePackageNameError::InvalidCharacter(s.into(), invalid));
    }
    let first_ok = s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let last_ok = s.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok || !last_ok {
        return Err(ParsePackageNameError::NonAlphanumericBoundary(s.into()));
    }
    Ok(())
}

/// PEP 503 normalization: lowercase, and collapse every run of separators into one dash. Extras
/// normalize the same way, so this is shared with [`crate::types::Extra`].
pub(crate) fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_separator = false;
    for c in s.chars() {
        if matches!(c, '-' | '_' | '.') {
            // A valid name never starts with a separator, so there is always something to attach
            // the dash to once the run ends.
            pending_separator = !out.is_empty();
        } else {
            if pending_separator {
                out.push('-');
                pending_separator = false;
            }
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

impl PackageName {
    /// Returns the source representation of the package name. This is the string from which this
    /// instance was created.
    pub fn as_source_str(&self) -> &str {
        self.source.as_ref()
    }

    /// Returns the canonical form of the package name.
    pub fn as_str(&self) -> &str {
        self.normalized.as_str()
    }

    /// Returns the canonical form of the package name as its own type.
    pub fn normalized(&self) -> &NormalizedPackageName {
        &self.normalized
    }
}

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate(s)?;
        Ok(PackageName {
            source: s.to_owned().into_boxed_str(),
            normalized: NormalizedPackageName(normalize(s).into_boxed_str()),
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized.eq(&other.normalized)
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl From<PackageName> for NormalizedPackageName {
    fn from(value: PackageName) -> Self {
        value.normalized
    }
}

impl From<NormalizedPackageName> for PackageName {
    fn from(value: NormalizedPackageName) -> Self {
        Self {
            source: value.0.clone(),
            normalized: value,
        }
    }
}

impl NormalizedPackageName {
    /// Returns a string reference
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for NormalizedPackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NormalizedPackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Borrow<str> for NormalizedPackageName {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packagename_basics() {
        let name1: PackageName = "Foo-Bar-Baz".parse().unwrap();
        assert_eq!(name1.as_source_str(), "Foo-Bar-Baz");
        assert_eq!(name1.as_str(), "foo-bar-baz");

        let name2: PackageName = "foo_bar.baz".parse().unwrap();
        assert_eq!(name2.as_source_str(), "foo_bar.baz");
        assert_eq!(name2.as_str(), "foo-bar-baz");

        assert_eq!(name1, name2);

        let name3: PackageName = "foo-barbaz".parse().unwrap();
        assert_ne!(name1, name3);
    }

    #[test]
    fn test_separator_runs_collapse() {
        let name: PackageName = "foo__bar..baz".parse().unwrap();
        assert_eq!(name.as_str(), "foo-bar-baz");
        assert_eq!(name, "foo-bar-baz".parse().unwrap());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once: NormalizedPackageName = "Typed_AST".parse().unwrap();
        let twice: NormalizedPackageName = once.as_str().parse().unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.as_str(), "typed-ast");
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            "".parse::<PackageName>(),
            Err(ParsePackageNameError::Empty)
        ));
        assert!(matches!(
            "-leading".parse::<PackageName>(),
            Err(ParsePackageNameError::NonAlphanumericBoundary(_))
        ));
        assert!(matches!(
            "trailing_".parse::<PackageName>(),
            Err(ParsePackageNameError::NonAlphanumericBoundary(_))
        ));
        assert!(matches!(
            "with space".parse::<PackageName>(),
            Err(ParsePackageNameError::InvalidCharacter(_, ' '))
        ));
    }
}
