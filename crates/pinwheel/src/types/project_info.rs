//! Structs that represent the responses of the package index: the Simple API
//! when using JSON (PEP 691) and the per-release JSON document.

use crate::types::{ArtifactName, NormalizedPackageName, VersionSpecifiers};
use rattler_digest::{serde::SerializableHash, Sha256};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr, VecSkipError};
use url::Url;

/// Represents the parsed response of the Simple API for a single project.
#[derive(Debug, Clone, Default)]
pub struct ProjectInfo {
    /// Metadata describing the API.
    pub meta: Meta,

    /// All the available files for this project.
    pub files: Vec<ArtifactInfo>,
}

impl ProjectInfo {
    /// Parses a PEP 691 JSON document. Files whose name cannot be matched against the project
    /// name or whose version does not parse are skipped, the index contains plenty of those.
    pub fn from_simple_json(
        name: &NormalizedPackageName,
        bytes: &[u8],
    ) -> Result<ProjectInfo, serde_json::Error> {
        let raw: RawProjectInfo = serde_json::from_slice(bytes)?;
        let files = raw
            .files
            .into_iter()
            .filter_map(|f| match ArtifactName::from_filename(&f.filename, name) {
                Ok(filename) => Some(ArtifactInfo {
                    filename,
                    url: f.url,
                    hashes: f.hashes,
                    requires_python: f.requires_python,
                    dist_info_metadata: f.dist_info_metadata,
                    yanked: f.yanked,
                }),
                Err(err) => {
                    tracing::debug!("skipping index file '{}': {}", f.filename, err);
                    None
                }
            })
            .collect();
        Ok(ProjectInfo {
            meta: raw.meta,
            files,
        })
    }
}

/// Describes a single artifact that is available for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    /// Artifact name
    pub filename: ArtifactName,
    /// Url to download the artifact
    pub url: Url,
    /// Hashes of the artifact
    pub hashes: Option<ArtifactHashes>,
    /// Python requirement
    pub requires_python: Option<VersionSpecifiers>,
    /// Whether the metadata is available as a separate download described in
    /// [PEP 658](https://www.python.org/dev/peps/pep-0658/)
    pub dist_info_metadata: DistInfoMetadata,
    /// Yanked information
    pub yanked: Yanked,
}

impl ArtifactInfo {
    /// Returns true if this artifact is a wheel.
    pub fn is_wheel(&self) -> bool {
        self.filename.as_wheel().is_some()
    }

    /// Returns true if this artifact is a source distribution.
    pub fn is_sdist(&self) -> bool {
        self.filename.as_sdist().is_some()
    }
}

/// The untyped form of a file entry in the PEP 691 response. The filename is kept as a string
/// because parsing it requires knowing the project name.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawArtifactInfo {
    filename: String,
    url: Url,
    #[serde(default)]
    hashes: Option<ArtifactHashes>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    requires_python: Option<VersionSpecifiers>,
    #[serde(default)]
    dist_info_metadata: DistInfoMetadata,
    #[serde(default)]
    yanked: Yanked,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
struct RawProjectInfo {
    #[serde(default)]
    meta: Meta,
    #[serde_as(as = "VecSkipError<_>")]
    #[serde(default)]
    files: Vec<RawArtifactInfo>,
}

/// Describes a set of hashes for a certain artifact. In theory all hash algorithms available via
/// Pythons `hashlib` are supported but we only support some common ones.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ArtifactHashes {
    #[serde_as(as = "Option<SerializableHash<Sha256>>")]
    /// Contains the optional sha256 hash of the artifact
    pub sha256: Option<rattler_digest::Sha256Hash>,
}

impl ArtifactHashes {
    /// Returns true if this instance does not contain a single hash.
    pub fn is_empty(&self) -> bool {
        self.sha256.is_none()
    }
}

/// Describes whether the metadata is available for download from the index as specified in PEP 658
/// (`{file_url}.metadata`). An index might also include hashes of the metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(from = "Option<RawDistInfoMetadata>")]
pub struct DistInfoMetadata {
    /// True if the metadata is available
    pub available: bool,
    /// Hashes to verify the metadata file
    pub hashes: ArtifactHashes,
}

/// An optional key that indicates that metadata for this file is available. Where this is present,
/// it MUST be either a boolean to indicate if the file has an associated metadata file, or a
/// dictionary mapping hash names to a hex encoded digest of the metadata’s hash.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawDistInfoMetadata {
    NoHashes(bool),
    WithHashes(ArtifactHashes),
}

impl From<Option<RawDistInfoMetadata>> for DistInfoMetadata {
    fn from(maybe_raw: Option<RawDistInfoMetadata>) -> Self {
        match maybe_raw {
            None => Default::default(),
            Some(raw) => match raw {
                RawDistInfoMetadata::NoHashes(available) => Self {
                    available,
                    hashes: Default::default(),
                },
                RawDistInfoMetadata::WithHashes(hashes) => Self {
                    available: true,
                    hashes,
                },
            },
        }
    }
}

/// Meta information stored in the [`ProjectInfo`]. It represents the version of the API. Clients
/// should verify that the contents is as expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    #[serde(rename = "api-version")]
    /// Version of the API
    pub version: String,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawYanked {
    NoReason(bool),
    WithReason(String),
}

/// Struct that describes whether a package is yanked or not.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(from = "RawYanked")]
pub struct Yanked {
    /// This is true if the package is yanked.
    pub yanked: bool,
    /// Optional reason why the package is yanked.
    pub reason: Option<String>,
}

impl From<RawYanked> for Yanked {
    fn from(raw: RawYanked) -> Self {
        match raw {
            RawYanked::NoReason(yanked) => Self {
                yanked,
                reason: None,
            },
            RawYanked::WithReason(reason) => Self {
                yanked: true,
                reason: Some(reason),
            },
        }
    }
}

/// The relevant subset of the per-release JSON document
/// (`GET /pypi/{name}/{version}/json`). It is used to read dependency information without
/// touching any artifact when the wheel fast path is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    /// The `info` key of the document.
    pub info: ReleaseData,
}

/// The dependency related fields of the per-release JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseData {
    /// The (non-normalized) project name.
    pub name: String,
    /// The release version.
    pub version: String,
    /// Raw requirement strings, exactly as the upstream metadata spells them.
    #[serde(default)]
    pub requires_dist: Option<Vec<String>>,
    /// Raw requires-python specifier.
    #[serde(default)]
    pub requires_python: Option<String>,
    /// Extras provided by this release.
    #[serde(default)]
    pub provides_extra: Option<Vec<String>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_simple_json() {
        let data = r#"{
            "meta": {"api-version": "1.0"},
            "files": [
                {"filename": "typed_ast-0.5.1.tar.gz", "url": "https://example.com/typed_ast-0.5.1.tar.gz", "hashes": {}},
                {"filename": "typed_ast-0.6.0-py3-none-any.whl", "url": "https://example.com/typed_ast-0.6.0-py3-none-any.whl", "hashes": {}, "requires-python": ">=3.8", "yanked": "broken"},
                {"filename": "not-a-typed-ast-file.txt", "url": "https://example.com/junk"}
            ]
        }"#;
        let name: NormalizedPackageName = "typed-ast".parse().unwrap();
        let info = ProjectInfo::from_simple_json(&name, data.as_bytes()).unwrap();
        assert_eq!(info.files.len(), 2);
        assert_eq!(info.files[0].filename.version(), &"0.5.1".parse().unwrap());
        assert!(info.files[1].yanked.yanked);
        assert_eq!(info.files[1].yanked.reason.as_deref(), Some("broken"));
        assert!(info.files[1].requires_python.is_some());
    }

    #[test]
    fn test_parse_release_json() {
        let data = r#"{
            "info": {
                "name": "pandas",
                "version": "1.5.2",
                "requires_dist": ["numpy (>=1.21.0)"],
                "requires_python": ">=3.8",
                "provides_extra": ["test"]
            }
        }"#;
        let release: ReleaseInfo = serde_json::from_str(data).unwrap();
        assert_eq!(release.info.name, "pandas");
        assert_eq!(release.info.requires_dist.unwrap().len(), 1);
    }
}
