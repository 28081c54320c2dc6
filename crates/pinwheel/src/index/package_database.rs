use crate::index::cache::{CacheKey, CacheStore};
use crate::index::http::{CacheMode, Http, HttpRequestError};
use crate::index::wheel_metadata::{
    lazy_read_wheel_metadata, read_wheel_metadata, WheelMetadataError,
};
use crate::resolve::parse_requirement_fixup;
use crate::types::{
    ArtifactInfo, CoreMetadata, Extra, MetadataVersion, NormalizedPackageName, PackageName,
    ProjectInfo, ReleaseInfo, Version, VersionSpecifiers,
};
use crate::utils::ReadAndSeek;
use async_http_range_reader::{AsyncHttpRangeReader, CheckSupportMethod};
use elsa::sync::FrozenMap;
use futures::{pin_mut, stream, StreamExt};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, StatusCode};
use indexmap::IndexMap;
use miette::Diagnostic;
use reqwest::{header::CACHE_CONTROL, Client};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// The artifacts of a single project, keyed by version, newest first.
pub type VersionArtifacts = IndexMap<Version, Vec<ArtifactInfo>>;

/// Cache of the available packages, artifacts and their metadata.
pub struct PackageDb {
    http: Http,

    /// Index URLS to query
    index_urls: Vec<Url>,

    /// Metadata records, keyed by artifact or release identity (see [`CacheKey`]).
    metadata_cache: CacheStore,

    /// A cache of package name to version to artifacts.
    artifacts: FrozenMap<NormalizedPackageName, Box<Arc<VersionArtifacts>>>,
}

/// An error that can occur while consulting the package index.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum PackageDbError {
    #[error("package '{0}' was not found in the index")]
    NoSuchPackage(NormalizedPackageName),

    #[error(transparent)]
    Http(#[from] HttpRequestError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("the index returned an invalid response for {0}: {1}")]
    InvalidIndexJson(Url, #[source] serde_json::Error),

    #[error("simple API page expected a JSON content type, but got {0}")]
    UnsupportedContentType(String),

    #[error("corrupt metadata for {0}: {1}")]
    MetadataCorrupt(String, String),

    #[error("failed to read wheel metadata from {0}")]
    WheelMetadata(String, #[source] WheelMetadataError),
}

impl PackageDb {
    /// Constructs a new [`PackageDb`] that reads information from the specified URLs.
    pub fn new(client: Client, index_urls: &[Url], cache_dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            http: Http::new(client, CacheStore::at(&cache_dir.join("http"))?),
            index_urls: index_urls.into(),
            metadata_cache: CacheStore::at(&cache_dir.join("metadata"))?,
            artifacts: Default::default(),
        })
    }

    /// Downloads and caches information about available artifacts of a package from the index.
    ///
    /// The result is ordered by version, newest first; files within a version are ordered by
    /// filename so two runs observe the candidates in the same order.
    pub async fn available_artifacts(
        &self,
        p: &NormalizedPackageName,
    ) -> Result<Arc<VersionArtifacts>, PackageDbError> {
        if let Some(cached) = self.artifacts.get(p) {
            return Ok(cached.clone());
        }

        // Start downloading the information for each url.
        let http = self.http.clone();
        let suffix = format!("{}/", p.as_str());
        let urls: Vec<Url> = self
            .index_urls
            .iter()
            .map(|url| url.join(&suffix).expect("invalid url"))
            .collect();
        let request_iter = stream::iter(urls)
            .map(|url| fetch_simple_api(&http, url, p))
            .buffer_unordered(10)
            .filter_map(|result| async { result.transpose() });

        pin_mut!(request_iter);

        // Add all the incoming results to the set of results
        let mut result = VersionArtifacts::default();
        let mut found_any = false;
        while let Some(response) = request_iter.next().await {
            found_any = true;
            for artifact in response?.files {
                result
                    .entry(artifact.filename.version().clone())
                    .or_default()
                    .push(artifact);
            }
        }

        if !found_any {
            return Err(PackageDbError::NoSuchPackage(p.clone()));
        }

        // Sort the artifact infos by name to get a stable resolution output.
        for artifact_infos in result.values_mut() {
            artifact_infos.sort_by_cached_key(|a| a.filename.to_string());
        }

        // Sort in descending order by version
        result.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));

        Ok(self.artifacts.insert(p.clone(), Box::new(Arc::new(result))).clone())
    }

    /// Reads the metadata for the given artifacts from the cache, or returns `None` if none of
    /// them has an entry. No network I/O happens here.
    pub fn metadata_from_cache(&self, artifacts: &[ArtifactInfo]) -> Option<CoreMetadata> {
        for artifact_info in artifacts {
            let Some(bytes) = self.metadata_cache.read(&CacheKey::for_artifact(artifact_info))
            else {
                continue;
            };
            match CoreMetadata::try_from(bytes.as_slice()) {
                Ok(metadata) => return Some(metadata),
                Err(err) => {
                    tracing::warn!(
                        "discarding cached metadata of '{}': {err}",
                        artifact_info.filename
                    );
                }
            }
        }
        None
    }

    /// Writes the metadata for the given artifact into the cache. If the metadata already exists
    /// its not overwritten.
    pub fn put_metadata_in_cache(
        &self,
        artifact_info: &ArtifactInfo,
        blob: &[u8],
    ) -> Result<(), PackageDbError> {
        self.metadata_cache
            .write_once(&CacheKey::for_artifact(artifact_info), blob)?;
        Ok(())
    }

    /// Returns the metadata of a wheel without downloading the entire archive when possible.
    ///
    /// Tries, in order: the PEP 658 metadata file next to the wheel, sparsely reading the remote
    /// zip through range requests, and finally downloading the whole wheel.
    pub async fn wheel_metadata(
        &self,
        artifact_info: &ArtifactInfo,
    ) -> Result<CoreMetadata, PackageDbError> {
        let wheel_name = artifact_info
            .filename
            .as_wheel()
            .expect("the specified artifact does not refer to a wheel");

        if let Some(metadata) = self.metadata_from_cache(std::slice::from_ref(artifact_info)) {
            return Ok(metadata);
        }

        // If the dist-info is available separately, we can use that instead
        if artifact_info.dist_info_metadata.available {
            return self.pep658_metadata(artifact_info).await;
        }

        // Try to load the data by sparsely reading the artifact (if supported)
        tracing::info!(url=%artifact_info.url, "lazy reading artifact");
        match AsyncHttpRangeReader::new(
            self.http.client.clone(),
            artifact_info.url.clone(),
            CheckSupportMethod::Head,
        )
        .await
        {
            Ok((mut reader, _headers)) => match lazy_read_wheel_metadata(wheel_name, &mut reader).await {
                Ok((blob, metadata)) => {
                    self.put_metadata_in_cache(artifact_info, &blob)?;
                    return Ok(metadata);
                }
                Err(err) => {
                    tracing::warn!("failed to sparsely read wheel file: {err}, falling back to downloading the whole file");
                }
            },
            Err(err) => {
                tracing::debug!("range requests not supported for {}: {err}", artifact_info.url);
            }
        }

        // Otherwise download the entire artifact through the cached transport
        let body = self
            .download_artifact(artifact_info, CacheMode::Default)
            .await?;
        let (blob, metadata) = read_wheel_metadata(wheel_name, body)
            .map_err(|e| PackageDbError::WheelMetadata(artifact_info.filename.to_string(), e))?;
        self.put_metadata_in_cache(artifact_info, &blob)?;
        Ok(metadata)
    }

    /// Retrieve the PEP 658 metadata for the given artifact.
    /// This assumes that the metadata is available in the repository.
    /// This can be checked with the [`ArtifactInfo::dist_info_metadata`] field.
    async fn pep658_metadata(
        &self,
        artifact_info: &ArtifactInfo,
    ) -> Result<CoreMetadata, PackageDbError> {
        // Turn into PEP 658 compliant URL
        let mut url = artifact_info.url.clone();
        url.set_path(&url.path().replace(".whl", ".whl.metadata"));

        let mut bytes = Vec::new();
        self.http
            .request(url, Method::GET, HeaderMap::default(), CacheMode::NoStore)
            .await?
            .into_body()
            .read_to_end(&mut bytes)
            .await?;

        let metadata = CoreMetadata::try_from(bytes.as_slice()).map_err(|e| {
            PackageDbError::MetadataCorrupt(artifact_info.filename.to_string(), e.to_string())
        })?;
        self.put_metadata_in_cache(artifact_info, &bytes)?;
        Ok(metadata)
    }

    /// Fetches the dependency information of a release from the per-release JSON document of the
    /// index (`/pypi/{name}/{version}/json`). This is used when the wheel fast path is disabled:
    /// the simple listing itself carries no dependency information.
    pub async fn release_metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
    ) -> Result<CoreMetadata, PackageDbError> {
        let cache_key = CacheKey::for_release(name, version);
        if let Some(bytes) = self.metadata_cache.read(&cache_key) {
            if let Ok(release) = serde_json::from_slice::<ReleaseInfo>(&bytes) {
                return release_into_metadata(name, version, release);
            }
        }

        let url = self
            .index_urls
            .first()
            .expect("a package database always has at least one index")
            .join(&format!("/pypi/{}/{}/json", name.as_str(), version))
            .expect("invalid url");

        let mut bytes = Vec::new();
        self.http
            .request(
                url.clone(),
                Method::GET,
                HeaderMap::default(),
                CacheMode::Default,
            )
            .await
            .map_err(|err| not_found_to_no_such_package(err, name))?
            .into_body()
            .read_to_end(&mut bytes)
            .await?;

        let release: ReleaseInfo = serde_json::from_slice(&bytes)
            .map_err(|e| PackageDbError::InvalidIndexJson(url, e))?;

        self.metadata_cache.write_once(&cache_key, &bytes)?;

        release_into_metadata(name, version, release)
    }

    /// Downloads the artifact body through the cached transport and makes it locally seekable.
    pub async fn download_artifact(
        &self,
        artifact_info: &ArtifactInfo,
        cache_mode: CacheMode,
    ) -> Result<Box<dyn ReadAndSeek + Send>, PackageDbError> {
        let body = self
            .http
            .request(
                artifact_info.url.clone(),
                Method::GET,
                HeaderMap::default(),
                cache_mode,
            )
            .await?
            .into_body()
            .into_local()
            .await?;
        Ok(body)
    }
}

/// Converts a 404 transport error into [`PackageDbError::NoSuchPackage`].
fn not_found_to_no_such_package(
    err: HttpRequestError,
    name: &NormalizedPackageName,
) -> PackageDbError {
    match &err {
        HttpRequestError::HttpError(e) if e.status() == Some(reqwest::StatusCode::NOT_FOUND) => {
            PackageDbError::NoSuchPackage(name.clone())
        }
        _ => PackageDbError::Http(err),
    }
}

/// Builds a [`CoreMetadata`] record from the per-release JSON document. All requirement strings
/// pass through the requirement fixup with the release as context.
fn release_into_metadata(
    name: &NormalizedPackageName,
    version: &Version,
    release: ReleaseInfo,
) -> Result<CoreMetadata, PackageDbError> {
    let corrupt = |msg: String| {
        PackageDbError::MetadataCorrupt(format!("{} {}", name.as_str(), version), msg)
    };

    let package_name = PackageName::from_str(&release.info.name)
        .map_err(|e| corrupt(format!("invalid name: {e}")))?;
    let fixup_context = format!("{} {}", package_name.as_source_str(), release.info.version);

    let mut requires_dist = Vec::new();
    for req_str in release.info.requires_dist.into_iter().flatten() {
        match parse_requirement_fixup(&req_str, &fixup_context) {
            Ok(req) => requires_dist.push(req),
            Err(e) => tracing::warn!("ignoring Requires-Dist: {req_str}, failed to parse: {e}"),
        }
    }

    let requires_python = release
        .info
        .requires_python
        .as_deref()
        .map(VersionSpecifiers::from_str)
        .transpose()
        .map_err(|e| corrupt(format!("invalid requires-python: {e}")))?;

    let extras = release
        .info
        .provides_extra
        .into_iter()
        .flatten()
        .filter_map(|e| Extra::from_str(&e).ok())
        .collect::<HashSet<_>>();

    Ok(CoreMetadata {
        name: package_name,
        version: Version::from_str(&release.info.version)
            .map_err(|e| corrupt(format!("invalid version: {e}")))?,
        metadata_version: MetadataVersion(
            Version::from_str("2.1").expect("cannot parse 2.1 version string"),
        ),
        requires_dist,
        requires_python,
        extras,
        dynamic: Vec::new(),
    })
}

async fn fetch_simple_api(
    http: &Http,
    url: Url,
    name: &NormalizedPackageName,
) -> Result<Option<ProjectInfo>, PackageDbError> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert(
        http::header::ACCEPT,
        HeaderValue::from_static("application/vnd.pypi.simple.v1+json"),
    );

    let response = match http.request(url, Method::GET, headers, CacheMode::Default).await {
        Ok(response) => response,
        // If the resource could not be found we simply return.
        Err(HttpRequestError::HttpError(e))
            if e.status() == Some(reqwest::StatusCode::NOT_FOUND) =>
        {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("application/vnd.pypi.simple.v1+json")
        .to_owned();

    let url = response
        .extensions()
        .get::<Url>()
        .expect("the transport always attaches the final url")
        .to_owned();

    let mut bytes = Vec::new();
    response.into_body().read_to_end(&mut bytes).await?;

    let content_type: mime::Mime = content_type
        .parse()
        .map_err(|_| PackageDbError::UnsupportedContentType(content_type.clone()))?;
    match (
        content_type.type_().as_str(),
        content_type.subtype().as_str(),
        content_type.suffix().map(|s| s.as_str()),
    ) {
        ("application", "json", _) | ("application", _, Some("json")) => Some(
            ProjectInfo::from_simple_json(name, &bytes)
                .map_err(|e| PackageDbError::InvalidIndexJson(url, e)),
        )
        .transpose(),
        _ => Err(PackageDbError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    #[ignore = "requires network access to pypi.org"]
    async fn test_available_packages() {
        let cache_dir = TempDir::new().unwrap();
        let package_db = PackageDb::new(
            Client::new(),
            &[Url::parse("https://pypi.org/simple/").unwrap()],
            cache_dir.path(),
        )
        .unwrap();

        // Get all the artifacts
        let name: NormalizedPackageName = "scikit-learn".parse().unwrap();
        let artifacts = package_db.available_artifacts(&name).await.unwrap();
        assert!(!artifacts.is_empty());

        // Versions are ordered newest first
        let versions: Vec<_> = artifacts.keys().collect();
        let mut sorted = versions.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(versions, sorted);
    }

    #[tokio::test]
    #[ignore = "requires network access to pypi.org"]
    async fn test_pep658() {
        let cache_dir = TempDir::new().unwrap();
        let package_db = PackageDb::new(
            Client::new(),
            &[Url::parse("https://pypi.org/simple/").unwrap()],
            cache_dir.path(),
        )
        .unwrap();

        let name: NormalizedPackageName = "numpy".parse().unwrap();
        let artifacts = package_db.available_artifacts(&name).await.unwrap();

        // Get an artifact with the dist-info attribute set
        let artifact_info = artifacts
            .iter()
            .flat_map(|(_, artifacts)| artifacts.iter())
            .find(|a| a.dist_info_metadata.available)
            .unwrap();

        let metadata = package_db.pep658_metadata(artifact_info).await.unwrap();
        assert_eq!(metadata.name.as_str(), "numpy");
    }
}
