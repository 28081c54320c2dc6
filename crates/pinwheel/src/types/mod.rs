//! This module contains all the types for working with PyPA packaging repositories.
//! We have tried to follow the PEP's and PyPA packaging guide as closely as possible.

mod artifact_name;

mod package_name;

mod core_metadata;

mod extra;

mod project_info;

mod rfc822ish;

pub use artifact_name::{
    ArtifactName, BuildTag, ParseArtifactNameError, SDistFilename, SDistFormat, WheelFilename,
};

pub use core_metadata::{CoreMetadata, CoreMetadataError, MetadataVersion};

pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};

pub use extra::Extra;

pub use project_info::{
    ArtifactHashes, ArtifactInfo, DistInfoMetadata, Meta, ProjectInfo, ReleaseInfo, Yanked,
};

pub(crate) use rfc822ish::RFC822ish;

pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::{MarkerEnvironment, Requirement};
