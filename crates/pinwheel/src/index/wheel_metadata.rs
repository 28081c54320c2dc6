//! Reading the `METADATA` file out of a wheel without installing it, either by sparsely reading
//! parts of the remote zip through http range requests or from a fully downloaded archive.

use crate::types::{CoreMetadata, CoreMetadataError, PackageName, Version, WheelFilename};
use crate::utils::ReadAndSeek;
use async_http_range_reader::AsyncHttpRangeReader;
use async_zip::base::read::seek::ZipFileReader;
use std::collections::HashSet;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::compat::TokioAsyncReadCompatExt;
use zip::{result::ZipError, ZipArchive};

/// An error that can occur while extracting metadata from a wheel.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum WheelMetadataError {
    #[error(".dist-info/ missing")]
    DistInfoMissing,

    #[error(".dist-info/METADATA missing")]
    MetadataMissing,

    #[error("found multiple .dist-info directories in wheel")]
    MultipleDistInfoDirs,

    #[error("invalid METADATA")]
    InvalidMetadata(#[from] CoreMetadataError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("failed to read the wheel file {0}")]
    ZipError(String, #[source] ZipError),

    #[error("failed to read the wheel file {0}: {1}")]
    AsyncZipError(String, #[source] async_zip::error::ZipError),
}

impl WheelMetadataError {
    fn from_zip(file: String, err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => WheelMetadataError::IoError(err),
            ZipError::FileNotFound if file.ends_with("METADATA") => {
                WheelMetadataError::MetadataMissing
            }
            _ => WheelMetadataError::ZipError(file, err),
        }
    }

    fn from_async_zip(file: String, err: async_zip::error::ZipError) -> Self {
        match err {
            async_zip::error::ZipError::UpstreamReadError(err) => WheelMetadataError::IoError(err),
            _ => WheelMetadataError::AsyncZipError(file, err),
        }
    }
}

/// A wheel file always contains a special directory named `<name>-<version>.dist-info` that holds
/// the metadata of the package. This function locates that directory among the top-level names.
fn find_dist_info_dir<'a>(
    top_level_names: impl IntoIterator<Item = &'a str>,
    name: &PackageName,
    version: &Version,
) -> Result<&'a str, WheelMetadataError> {
    let mut candidates = top_level_names.into_iter().filter(|dir_name| {
        let Some(candidate) = dir_name.strip_suffix(".dist-info") else {
            return false;
        };
        let Some((candidate_name, candidate_version)) = candidate.rsplit_once('-') else {
            return false;
        };

        let Ok(candidate_name) = PackageName::from_str(candidate_name) else {
            return false;
        };
        let Ok(candidate_version) = Version::from_str(candidate_version) else {
            return false;
        };

        &candidate_name == name && &candidate_version == version
    });

    let candidate = candidates.next().ok_or(WheelMetadataError::DistInfoMissing)?;
    if candidates.next().is_some() {
        return Err(WheelMetadataError::MultipleDistInfoDirs);
    }

    Ok(candidate)
}

/// Reads the metadata from a wheel by only reading parts of the wheel zip.
///
/// This function uses [`AsyncHttpRangeReader`] which allows reading parts of a file by performing
/// http range requests. First the end of the file is read to index the central directory of the
/// zip. This provides an index into the file which allows accessing the exact bytes that contain
/// the METADATA file.
pub(crate) async fn lazy_read_wheel_metadata(
    name: &WheelFilename,
    stream: &mut AsyncHttpRangeReader,
) -> Result<(Vec<u8>, CoreMetadata), WheelMetadataError> {
    // Make sure we have the back part of the stream.
    // Best guess for the central directory size inside the zip
    const CENTRAL_DIRECTORY_SIZE: u64 = 16384;
    // Because the zip index is at the back
    stream
        .prefetch(stream.len().saturating_sub(CENTRAL_DIRECTORY_SIZE)..stream.len())
        .await;

    // Construct a zip reader to uses the stream.
    let mut reader = ZipFileReader::new(stream.compat())
        .await
        .map_err(|err| WheelMetadataError::from_async_zip("/".into(), err))?;

    // Collect all top-level filenames
    let top_level_names = reader
        .file()
        .entries()
        .iter()
        .filter_map(|e| e.filename().as_str().ok())
        .map(|filename| {
            filename
                .split_once(['/', '\\'])
                .map_or_else(|| filename, |(base, _)| base)
        })
        .collect::<HashSet<_>>();

    // Determine the name of the dist-info directory
    let dist_info = find_dist_info_dir(
        top_level_names.iter().copied(),
        &name.distribution,
        &name.version,
    )?
    .to_owned();

    let metadata_path = format!("{dist_info}/METADATA");
    let (metadata_idx, metadata_entry) = reader
        .file()
        .entries()
        .iter()
        .enumerate()
        .find(|(_, p)| p.filename().as_str().ok() == Some(metadata_path.as_str()))
        .ok_or(WheelMetadataError::MetadataMissing)?;

    // Get the size of the entry plus the header + size of the filename. We should also actually
    // include bytes for the extra fields but we don't have that information.
    let offset = metadata_entry.header_offset();
    let size = metadata_entry.compressed_size()
        + 30 // Header size in bytes
        + metadata_entry.filename().as_bytes().len() as u64;

    // The zip archive uses as BufReader which reads in chunks of 8192. To ensure we prefetch
    // enough data we round the size up to the nearest multiple of the buffer size.
    let buffer_size = 8192;
    let size = ((size + buffer_size - 1) / buffer_size) * buffer_size;

    // Fetch the bytes from the zip archive that contain the requested file.
    reader
        .inner_mut()
        .get_mut()
        .prefetch(offset..offset + size)
        .await;

    // Read the contents of the METADATA file
    let mut contents = Vec::new();
    reader
        .reader_with_entry(metadata_idx)
        .await
        .map_err(|e| WheelMetadataError::from_async_zip(metadata_path.clone(), e))?
        .read_to_end_checked(&mut contents)
        .await
        .map_err(|e| WheelMetadataError::from_async_zip(metadata_path, e))?;

    // Parse the wheel data
    let metadata = CoreMetadata::try_from(contents.as_slice())?;

    let stream = reader.into_inner().into_inner();
    let ranges = stream.requested_ranges().await;
    let total_bytes_fetched: u64 = ranges.iter().map(|r| r.end - r.start).sum();
    tracing::debug!(
        "fetched {} ranges, total of {} bytes, total file length {} ({}%)",
        ranges.len(),
        total_bytes_fetched,
        stream.len(),
        (total_bytes_fetched as f64 / stream.len() as f64 * 100000.0).round() / 100.0
    );

    Ok((contents, metadata))
}

/// Reads the metadata from a fully downloaded wheel archive.
pub(crate) fn read_wheel_metadata(
    name: &WheelFilename,
    reader: impl ReadAndSeek,
) -> Result<(Vec<u8>, CoreMetadata), WheelMetadataError> {
    let mut archive =
        ZipArchive::new(reader).map_err(|err| WheelMetadataError::from_zip("/".into(), err))?;

    // Determine the top level filenames in the wheel
    let top_level_names = archive
        .file_names()
        .map(|filename| {
            filename
                .split_once(['/', '\\'])
                .map_or_else(|| filename, |(base, _)| base)
        })
        .map(ToOwned::to_owned)
        .collect::<HashSet<String>>();

    // Determine the name of the dist-info directory
    let dist_info = find_dist_info_dir(
        top_level_names.iter().map(String::as_str),
        &name.distribution,
        &name.version,
    )?
    .to_owned();

    let metadata_path = format!("{dist_info}/METADATA");
    let mut contents = Vec::new();
    archive
        .by_name(&metadata_path)
        .map_err(|err| WheelMetadataError::from_zip(metadata_path.clone(), err))?
        .read_to_end(&mut contents)?;

    let metadata = CoreMetadata::try_from(contents.as_slice())?;
    Ok((contents, metadata))
}
