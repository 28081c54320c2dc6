//! Turns a source distribution into a metadata record by downloading the archive, unpacking it
//! and driving the build backend declared in its `pyproject.toml`.

use crate::index::{CacheMode, PackageDb, PackageDbError};
use crate::python_env::{FindPythonError, PythonLocation};
use crate::resolve::BuildExecutor;
use crate::types::{ArtifactInfo, CoreMetadata, SDistFilename, SDistFormat};
use crate::utils::ReadAndSeek;
use async_once_cell::OnceCell;
use flate2::read::GzDecoder;
use fs_err as fs;
use miette::Diagnostic;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tar::Archive;
use thiserror::Error;
use tokio::sync::Semaphore;
use zip::ZipArchive;

/// Builds metadata records for source distributions.
///
/// At most one build is in flight per sdist filename; concurrent requests for the same key await
/// the first one. Finished builds land in the metadata cache of the [`PackageDb`] so a later run
/// in the same process, or a later process sharing the cache directory, does not build at all.
pub struct SDistBuilder {
    package_db: Arc<PackageDb>,

    /// The interpreter used to run the build backend.
    python: PathBuf,

    /// Extra environment variables for the build backend subprocess, on top of the inherited
    /// environment.
    env_variables: HashMap<String, String>,

    executor: BuildExecutor,

    /// Bounds the number of concurrent builds when the executor is a pool.
    build_permits: Option<Arc<Semaphore>>,

    in_flight: Mutex<HashMap<String, Arc<OnceCell<CoreMetadata>>>>,
}

/// An error that can occur while building metadata from an sdist.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum SDistBuildError {
    #[error(transparent)]
    Db(#[from] PackageDbError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    NoInterpreter(#[from] FindPythonError),

    #[error("failed to extract sdist {0}: {1}")]
    Extraction(String, String),

    #[error(
        "failed to build metadata for {filename}\n--- stdout:\n{stdout}\n--- stderr:\n{stderr}"
    )]
    BuildFailed {
        filename: String,
        stdout: String,
        stderr: String,
    },

    #[error("could not parse the metadata produced for {0}: {1}")]
    MetadataCorrupt(String, String),
}

impl SDistBuilder {
    /// Constructs a new builder. The interpreter is resolved once, up front.
    pub fn new(
        package_db: Arc<PackageDb>,
        python_location: &PythonLocation,
        executor: BuildExecutor,
        env_variables: HashMap<String, String>,
    ) -> Result<Self, SDistBuildError> {
        let build_permits = match executor {
            BuildExecutor::Pool { limit } => Some(Arc::new(Semaphore::new(limit))),
            BuildExecutor::Synchronous => None,
        };
        Ok(Self {
            package_db,
            python: python_location.executable()?,
            env_variables,
            executor,
            build_permits,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the metadata record for the given sdist, building it if it is not cached yet.
    pub async fn build_metadata(
        &self,
        artifact_info: &ArtifactInfo,
    ) -> Result<CoreMetadata, SDistBuildError> {
        let sdist_name = artifact_info
            .filename
            .as_sdist()
            .expect("the specified artifact does not refer to an sdist");

        if let Some(metadata) = self
            .package_db
            .metadata_from_cache(std::slice::from_ref(artifact_info))
        {
            tracing::info!("using cached metadata for {}", artifact_info.filename);
            return Ok(metadata);
        }

        let cell = self
            .in_flight
            .lock()
            .entry(artifact_info.filename.to_string())
            .or_default()
            .clone();

        let metadata = cell
            .get_or_try_init(self.build_uncached(artifact_info, sdist_name))
            .await?;
        Ok(metadata.clone())
    }

    async fn build_uncached(
        &self,
        artifact_info: &ArtifactInfo,
        sdist_name: &SDistFilename,
    ) -> Result<CoreMetadata, SDistBuildError> {
        let filename = artifact_info.filename.to_string();
        tracing::info!("building metadata for {filename}");

        let body = self
            .package_db
            .download_artifact(artifact_info, CacheMode::Default)
            .await?;

        // The temporary directory is released on every exit path below.
        let work_dir = tempfile::tempdir()?;
        let extracted = work_dir.path().join("extracted");
        extract_archive(sdist_name.format, body, &extracted)
            .map_err(|e| SDistBuildError::Extraction(filename.clone(), e.to_string()))?;

        // An sdist must contain exactly one top-level directory.
        let mut entries = fs::read_dir(&extracted)?.collect::<Result<Vec<_>, _>>()?;
        let src_dir = match (entries.pop(), entries.is_empty()) {
            (Some(entry), true) => entry.path(),
            _ => {
                return Err(SDistBuildError::Extraction(
                    filename,
                    String::from("archive does not contain exactly one top-level entry"),
                ))
            }
        };

        // If the sdist ships trustworthy static metadata we can skip the build entirely.
        if let Some(metadata) = self.static_pkg_info(&src_dir, artifact_info)? {
            return Ok(metadata);
        }

        let metadata_dir = work_dir.path().join("metadata");
        fs::create_dir_all(&metadata_dir)?;

        let output = self
            .run_backend(src_dir.clone(), metadata_dir.clone())
            .await?;

        if !output.status.success() {
            return Err(SDistBuildError::BuildFailed {
                filename,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // The backend produced a single `<name>-<version>.dist-info` directory.
        let dist_info = fs::read_dir(&metadata_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".dist-info"))
            })
            .ok_or_else(|| {
                SDistBuildError::MetadataCorrupt(
                    filename.clone(),
                    String::from("build backend did not produce a .dist-info directory"),
                )
            })?;

        let blob = fs::read(dist_info.join("METADATA"))?;
        let metadata = CoreMetadata::try_from(blob.as_slice())
            .map_err(|e| SDistBuildError::MetadataCorrupt(filename, e.to_string()))?;

        self.package_db.put_metadata_in_cache(artifact_info, &blob)?;
        Ok(metadata)
    }

    /// Reads `PKG-INFO` from the extracted source tree. The result is only used when the metadata
    /// version implements PEP 643 and none of the dependency fields is declared dynamic.
    fn static_pkg_info(
        &self,
        src_dir: &Path,
        artifact_info: &ArtifactInfo,
    ) -> Result<Option<CoreMetadata>, SDistBuildError> {
        let path = src_dir.join("PKG-INFO");
        let Ok(blob) = fs::read(&path) else {
            return Ok(None);
        };
        match CoreMetadata::try_from(blob.as_slice()) {
            Ok(metadata)
                if metadata.metadata_version.implements_pep643()
                    && !metadata.has_dynamic_dependencies() =>
            {
                tracing::debug!("using static PKG-INFO for {}", artifact_info.filename);
                self.package_db.put_metadata_in_cache(artifact_info, &blob)?;
                Ok(Some(metadata))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::warn!("ignoring unparseable PKG-INFO in {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    /// Runs the build backend subprocess on the configured executor.
    async fn run_backend(
        &self,
        src_dir: PathBuf,
        metadata_dir: PathBuf,
    ) -> Result<Output, SDistBuildError> {
        let python = self.python.clone();
        let env_variables = self.env_variables.clone();
        match self.executor {
            BuildExecutor::Synchronous => {
                Ok(run_build_backend(&python, &src_dir, &metadata_dir, &env_variables)?)
            }
            BuildExecutor::Pool { .. } => {
                let permits = self
                    .build_permits
                    .as_ref()
                    .expect("a pool executor always has permits")
                    .clone();
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("the build semaphore is never closed");
                match tokio::task::spawn_blocking(move || {
                    run_build_backend(&python, &src_dir, &metadata_dir, &env_variables)
                })
                .await
                {
                    Ok(result) => Ok(result?),
                    Err(err) => match err.try_into_panic() {
                        Ok(panic) => std::panic::resume_unwind(panic),
                        Err(_) => Err(SDistBuildError::Io(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "the build task was cancelled",
                        ))),
                    },
                }
            }
        }
    }
}

/// Invokes `prepare_metadata_for_build_wheel` of the build backend declared by the source tree.
/// The subprocess inherits the environment of this process plus the caller supplied overrides;
/// stdout and stderr are captured for error reporting.
fn run_build_backend(
    python: &Path,
    src_dir: &Path,
    metadata_dir: &Path,
    env_variables: &HashMap<String, String>,
) -> std::io::Result<Output> {
    let script = include_str!("sdist_builder/prepare_metadata.py");
    std::process::Command::new(python)
        .arg("-c")
        .arg(script)
        .arg(src_dir)
        .arg(metadata_dir)
        .envs(env_variables)
        .output()
}

/// Unpacks the downloaded archive into `dest`.
fn extract_archive(
    format: SDistFormat,
    body: Box<dyn ReadAndSeek + Send>,
    dest: &Path,
) -> std::io::Result<()> {
    match format {
        SDistFormat::TarGz => Archive::new(GzDecoder::new(body)).unpack(dest),
        SDistFormat::Tar => Archive::new(body).unpack(dest),
        SDistFormat::Zip => ZipArchive::new(body)
            .and_then(|mut archive| archive.extract(dest).map(|_| archive))
            .map(|_| ())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        unsupported => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("sdist format '{unsupported}' is not supported"),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Cursor, Write};

    fn tar_gz_with_entries(entries: &[(&str, &str)]) -> Box<dyn ReadAndSeek + Send> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_bytes()).unwrap();
        }
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        Box::new(Cursor::new(bytes))
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let body = tar_gz_with_entries(&[("demo-1.0/PKG-INFO", "Metadata-Version: 2.1\n")]);
        extract_archive(SDistFormat::TarGz, body, &dest).unwrap();
        assert!(dest.join("demo-1.0/PKG-INFO").is_file());
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        let mut zip_bytes = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut zip_bytes);
            writer
                .start_file("demo-1.0/PKG-INFO", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"Metadata-Version: 2.1\n").unwrap();
            writer.finish().unwrap();
        }
        zip_bytes.set_position(0);

        extract_archive(SDistFormat::Zip, Box::new(zip_bytes), &dest).unwrap();
        assert!(dest.join("demo-1.0/PKG-INFO").is_file());
    }

    #[test]
    fn test_unsupported_format() {
        let err = extract_archive(
            SDistFormat::TarXz,
            Box::new(Cursor::new(Vec::new())),
            Path::new("/nonexistent"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
    }
}
