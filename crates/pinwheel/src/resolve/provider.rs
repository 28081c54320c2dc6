use crate::index::{PackageDb, PackageDbError, VersionArtifacts};
use crate::resolve::solve_options::ResolveOptions;
use crate::sdist_builder::{SDistBuildError, SDistBuilder};
use crate::tags::WheelTags;
use crate::types::{ArtifactInfo, CoreMetadata, NormalizedPackageName, Version};
use async_trait::async_trait;
use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

/// An error produced while discovering candidates or acquiring metadata.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum MetadataError {
    #[error("package '{0}' was not found in the index")]
    NoSuchPackage(NormalizedPackageName),

    #[error("no usable artifact available for {0} {1}")]
    NoUsableArtifact(NormalizedPackageName, Version),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Db(#[from] PackageDbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] SDistBuildError),
}

impl MetadataError {
    /// True when the error condemns only the single `(name, version)` candidate it was produced
    /// for. The resolver forbids that version and backtracks. Everything else (transport and io
    /// failures in particular) aborts the resolution and propagates.
    pub fn forbids_candidate(&self) -> bool {
        match self {
            MetadataError::NoUsableArtifact(_, _) => true,
            MetadataError::NoSuchPackage(_) => false,
            MetadataError::Db(db) => db_error_forbids_candidate(db),
            MetadataError::Build(build) => match build {
                SDistBuildError::BuildFailed { .. }
                | SDistBuildError::Extraction(_, _)
                | SDistBuildError::MetadataCorrupt(_, _) => true,
                SDistBuildError::Db(db) => db_error_forbids_candidate(db),
                SDistBuildError::Io(_) | SDistBuildError::NoInterpreter(_) => false,
            },
        }
    }
}

fn db_error_forbids_candidate(err: &PackageDbError) -> bool {
    matches!(
        err,
        PackageDbError::MetadataCorrupt(_, _)
            | PackageDbError::WheelMetadata(_, _)
            | PackageDbError::InvalidIndexJson(_, _)
    )
}

/// The seam between the resolver engine and the outside world: candidate discovery and metadata
/// acquisition. The engine never talks to the network itself, it only consumes this trait.
#[async_trait]
pub trait DependencyProvider: Send + Sync {
    /// Returns every published version of the package with its release files, newest first.
    async fn available_versions(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<Arc<VersionArtifacts>, MetadataError>;

    /// Returns the metadata record of a single candidate. `files` are the release files of
    /// exactly that version as previously returned by [`Self::available_versions`].
    async fn metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        files: &[ArtifactInfo],
    ) -> Result<CoreMetadata, MetadataError>;
}

/// The production [`DependencyProvider`]: candidates come from the simple index, metadata from
/// wheels (PEP 658 sidecar or range requests), from the per-release JSON document, or from
/// building an sdist, in that order of preference.
pub struct PypiDependencyProvider {
    package_db: Arc<PackageDb>,
    sdist_builder: SDistBuilder,
    compatible_tags: Option<Arc<WheelTags>>,
    download_wheels: bool,
}

impl PypiDependencyProvider {
    /// Creates a new provider.
    pub fn new(
        package_db: Arc<PackageDb>,
        compatible_tags: Option<Arc<WheelTags>>,
        options: &ResolveOptions,
    ) -> Result<Self, SDistBuildError> {
        let sdist_builder = SDistBuilder::new(
            package_db.clone(),
            &options.python_location,
            options.executor,
            options.env_variables.clone(),
        )?;
        Ok(Self {
            package_db,
            sdist_builder,
            compatible_tags,
            download_wheels: options.download_wheels,
        })
    }

    /// The wheels of a release that are usable on the target interpreter, most specific tag
    /// first. Wheels of equal tag priority are ordered by lexicographically smallest filename so
    /// two runs read the same artifact.
    fn ranked_wheels<'a>(&self, files: &'a [ArtifactInfo]) -> Vec<&'a ArtifactInfo> {
        let mut wheels: Vec<&ArtifactInfo> = files
            .iter()
            .filter(|f| !f.yanked.yanked && f.is_wheel())
            .collect();

        if let Some(tags) = &self.compatible_tags {
            wheels.retain(|artifact| {
                artifact
                    .filename
                    .as_wheel()
                    .expect("only wheels are considered")
                    .all_tags_iter()
                    .any(|t| tags.is_compatible(&t))
            });
            wheels.sort_by_cached_key(|artifact| {
                let priority = artifact
                    .filename
                    .as_wheel()
                    .expect("only wheels are considered")
                    .all_tags_iter()
                    .filter_map(|tag| tags.compatibility(&tag))
                    .max()
                    .unwrap_or(i32::MIN);
                (-priority, artifact.filename.to_string())
            });
        } else {
            wheels.sort_by_cached_key(|artifact| artifact.filename.to_string());
        }

        wheels
    }

    /// The sdist to build if no wheel is usable.
    fn usable_sdist<'a>(&self, files: &'a [ArtifactInfo]) -> Option<&'a ArtifactInfo> {
        files
            .iter()
            .filter(|f| !f.yanked.yanked)
            .filter(|f| {
                f.filename
                    .as_sdist()
                    .is_some_and(|sdist| sdist.format.is_supported())
            })
            .min_by_key(|f| f.filename.to_string())
    }
}

#[async_trait]
impl DependencyProvider for PypiDependencyProvider {
    async fn available_versions(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<Arc<VersionArtifacts>, MetadataError> {
        self.package_db
            .available_artifacts(name)
            .await
            .map_err(|err| match err {
                PackageDbError::NoSuchPackage(name) => MetadataError::NoSuchPackage(name),
                err => err.into(),
            })
    }

    async fn metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        files: &[ArtifactInfo],
    ) -> Result<CoreMetadata, MetadataError> {
        // A cache hit never touches the network, whichever path originally produced the record.
        if let Some(metadata) = self.package_db.metadata_from_cache(files) {
            return Ok(metadata);
        }

        let wheels = self.ranked_wheels(files);
        if !wheels.is_empty() {
            if self.download_wheels {
                for wheel in &wheels {
                    match self.package_db.wheel_metadata(wheel).await {
                        Ok(metadata) => return Ok(metadata),
                        Err(err) if db_error_forbids_candidate(&err) => {
                            tracing::warn!(
                                "error reading metadata from artifact '{}' skipping ({err})",
                                wheel.filename
                            );
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            } else {
                match self.package_db.release_metadata(name, version).await {
                    Ok(metadata) => return Ok(metadata),
                    Err(PackageDbError::NoSuchPackage(_)) => {
                        // The index has no per-release document, read a wheel after all.
                        tracing::debug!(
                            "no per-release document for {name} {version}, reading a wheel instead"
                        );
                        if let Some(wheel) = wheels.first() {
                            return Ok(self.package_db.wheel_metadata(wheel).await?);
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(sdist) = self.usable_sdist(files) {
            return Ok(self.sdist_builder.build_metadata(sdist).await?);
        }

        Err(MetadataError::NoUsableArtifact(
            name.clone(),
            version.clone(),
        ))
    }
}
