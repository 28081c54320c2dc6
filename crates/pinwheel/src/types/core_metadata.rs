// Implementation comes from https://github.com/njsmith/posy/blob/main/src/vocab/core_metadata.rs
// Licensed under MIT or Apache-2.0

use crate::resolve::parse_requirement_fixup;
use crate::types::{
    Extra, PackageName, ParsePackageNameError, RFC822ish, Version, VersionSpecifiers,
};
use once_cell::sync::Lazy;
use pep440_rs::Pep440Error;
use pep508_rs::Requirement;
use std::{collections::HashSet, str::FromStr};
use thiserror::Error;

/// The core metadata of a distribution: the parsed form of the `METADATA`
/// file inside a wheel or the `PKG-INFO` file inside an sdist.
#[derive(Debug, Clone)]
pub struct CoreMetadata {
    /// The name of the package
    pub name: PackageName,
    /// Version w.r.t to PEP440
    pub version: Version,
    /// Version of the metadata
    pub metadata_version: MetadataVersion,
    /// Requirements for this distribution
    /// Matches the Requires-Dist field
    pub requires_dist: Vec<Requirement>,
    /// Python requirement
    pub requires_python: Option<VersionSpecifiers>,
    /// Extras provided by this distribution
    pub extras: HashSet<Extra>,
    /// Fields declared as dynamic (metadata 2.2), empty for wheels
    pub dynamic: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Wrapper around a PEP440 version
/// specifically for the metadata version
pub struct MetadataVersion(pub Version);

impl MetadataVersion {
    /// We consider that this implements PEP643
    /// if the version is 2.2 or higher.
    pub fn implements_pep643(&self) -> bool {
        static VERSION_2_2: Lazy<MetadataVersion> = Lazy::new(|| {
            MetadataVersion(Version::from_str("2.2").expect("cannot parse 2.2 version string"))
        });

        if self < &VERSION_2_2 {
            return false;
        }
        true
    }
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum CoreMetadataError {
    #[error(transparent)]
    FailedToParseMetadata(#[from] <RFC822ish as FromStr>::Err),

    #[error("missing key {0} in METADATA")]
    MissingKey(String),

    #[error("duplicate key {0} in METADATA")]
    DuplicateKey(String),

    #[error("invalid Metadata-Version: {0}")]
    InvalidMetadataVersion(String),

    #[error("invalid Version: {0}")]
    InvalidVersion(String),

    #[error("invalid Requires-Python: {0}")]
    InvalidRequiresPython(#[source] Pep440Error),

    #[error("unsupported METADATA version {0}")]
    UnsupportedVersion(Version),

    #[error(transparent)]
    InvalidPackageName(#[from] ParsePackageNameError),

    #[error("{0}")]
    FailedToParse(String),
}

impl TryFrom<&[u8]> for CoreMetadata {
    type Error = CoreMetadataError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (name, version, metadata_version, mut parsed) = parse_common(value)?;
        let fixup_context = format!("{} {}", name.as_source_str(), version);

        let mut requires_dist = Vec::new();
        for req_str in parsed.take_all("Requires-Dist").into_iter() {
            match parse_requirement_fixup(&req_str, &fixup_context) {
                Err(e) => {
                    tracing::warn!("ignoring Requires-Dist: {req_str}, failed to parse: {e}")
                }
                Ok(req) => requires_dist.push(req),
            }
        }

        let requires_python = parsed
            .maybe_take("Requires-Python")
            .map_err(|_| CoreMetadataError::DuplicateKey(String::from("Requires-Python")))?
            .as_deref()
            .map(VersionSpecifiers::from_str)
            .transpose()
            .map_err(CoreMetadataError::InvalidRequiresPython)?;

        let mut extras: HashSet<Extra> = HashSet::new();
        for extra in parsed.take_all("Provides-Extra").drain(..) {
            match extra.parse() {
                Ok(extra) => {
                    extras.insert(extra);
                }
                Err(e) => tracing::warn!("ignoring Provides-Extra: {extra}, failed to parse: {e}"),
            }
        }

        let dynamic = parsed.take_all("Dynamic");

        Ok(CoreMetadata {
            name,
            version,
            metadata_version,
            requires_dist,
            requires_python,
            extras,
            dynamic,
        })
    }
}

impl CoreMetadata {
    /// Returns true if any of the dependency related fields is declared dynamic, which means the
    /// values in a PKG-INFO file cannot be trusted without running the build backend.
    pub fn has_dynamic_dependencies(&self) -> bool {
        self.dynamic.iter().any(|field| {
            field.eq_ignore_ascii_case("Requires-Dist")
                || field.eq_ignore_ascii_case("Requires-Python")
                || field.eq_ignore_ascii_case("Provides-Extra")
        })
    }
}

fn parse_common(
    input: &[u8],
) -> Result<(PackageName, Version, MetadataVersion, RFC822ish), CoreMetadataError> {
    let input = String::from_utf8_lossy(input);
    let mut parsed = RFC822ish::from_str(&input)?;

    static NEXT_MAJOR_METADATA_VERSION: Lazy<Version> =
        Lazy::new(|| Version::from_str("3").unwrap());

    // Quoth https://packaging.python.org/specifications/core-metadata:
    // "Automated tools consuming metadata SHOULD warn if metadata_version
    // is greater than the highest version they support, and MUST fail if
    // metadata_version has a greater major version than the highest
    // version they support (as described in PEP 440, the major version is
    // the value before the first dot)."
    //
    // We do the MUST, but skip the warning on unrecognized minor revisions:
    // by definition old software is supposed to handle those "well enough",
    // and new metadata releases are rare and much-discussed beforehand.
    let metadata_version = parsed
        .take("Metadata-Version")
        .map_err(|_| CoreMetadataError::MissingKey(String::from("Metadata-Version")))?;
    let metadata_version: Version = metadata_version
        .parse()
        .map_err(CoreMetadataError::InvalidMetadataVersion)?;
    if metadata_version >= *NEXT_MAJOR_METADATA_VERSION {
        return Err(CoreMetadataError::UnsupportedVersion(metadata_version));
    }

    let version_str = parsed
        .take("Version")
        .map_err(|_| CoreMetadataError::MissingKey(String::from("Version")))?;

    Ok((
        parsed
            .take("Name")
            .map_err(|_| CoreMetadataError::MissingKey(String::from("Name")))?
            .parse()?,
        version_str
            .parse()
            .map_err(CoreMetadataError::InvalidVersion)?,
        MetadataVersion(metadata_version),
        parsed,
    ))
}
