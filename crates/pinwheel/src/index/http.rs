//! The transport of the index: a `reqwest` client behind the on-disk response cache, applying
//! RFC 9111 semantics via `http-cache-semantics`. Retrying is not done here, the resolver treats
//! transport failures as fatal and propagates them.

use super::cache::{CacheKey, CacheStore, Entry, EntryWriter};
use crate::utils::{SeekSlice, StreamingOrLocal};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use http_cache_semantics::{AfterResponse, BeforeRequest, CachePolicy};
use miette::Diagnostic;
use reqwest::{header::HeaderMap, Client, Method};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use url::Url;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Different caching semantics that can be applied to a request.
pub enum CacheMode {
    /// Apply regular HTTP caching semantics
    Default,
    /// If we have a valid cache entry, return it; otherwise return Err(NotCached)
    OnlyIfCached,
    /// Don't look in cache, and don't write to cache
    NoStore,
}

/// The error returned when a request is made with [`CacheMode::OnlyIfCached`] but the cache does
/// not hold a valid entry.
#[derive(Debug, Diagnostic)]
pub struct NotCached;

impl Display for NotCached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request not in cache, and cache_mode=OnlyIfCached")
    }
}

impl std::error::Error for NotCached {}

/// An error that can occur while performing a (cached) request.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum HttpRequestError {
    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    NotCached(#[from] NotCached),
}

/// The caching HTTP client of the index.
#[derive(Debug, Clone)]
pub struct Http {
    pub(crate) client: Client,
    cache: Arc<CacheStore>,
}

/// What sits in front of the body in every cached response entry.
#[derive(Serialize, Deserialize)]
struct EntryHeader {
    policy: CachePolicy,
    url: Url,
}

impl Http {
    /// Constructs a new instance around the response cache.
    pub fn new(client: Client, cache: CacheStore) -> Self {
        Http {
            client,
            cache: Arc::new(cache),
        }
    }

    /// Performs a single request, consulting and filling the response cache as `cache_mode`
    /// dictates.
    pub async fn request(
        &self,
        url: Url,
        method: Method,
        headers: HeaderMap,
        cache_mode: CacheMode,
    ) -> Result<http::Response<StreamingOrLocal>, HttpRequestError> {
        tracing::info!(url=%url, cache_mode=?cache_mode, "executing request");

        let request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .build()?;

        if cache_mode == CacheMode::NoStore {
            let response = self.client.execute(request).await?.error_for_status()?;
            let final_url = response.url().clone();
            let (parts, body) = convert_response(response).into_parts();
            return Ok(make_response(parts, streaming_body(body), final_url));
        }

        // One locked entry per key: a second task asking for the same resource blocks here and
        // then reads whatever the first one stored.
        let key = CacheKey::for_request(&method, &url, &headers);
        let entry = match cache_mode {
            CacheMode::OnlyIfCached => self.cache.existing_entry(&key).ok_or(NotCached)?,
            _ => self.cache.entry(&key)?,
        };

        let cached = entry.open().and_then(|file| match open_entry(file) {
            Ok(found) => Some(found),
            Err(err) => {
                tracing::debug!(url=%url, "discarding unreadable cache entry: {err}");
                None
            }
        });

        match cached {
            Some((header, body)) => match header.policy.before_request(&request, SystemTime::now())
            {
                BeforeRequest::Fresh(parts) => {
                    tracing::debug!(url=%url, "cache entry is fresh");
                    Ok(make_response(parts, local_body(body), header.url))
                }
                BeforeRequest::Stale {
                    request: new_parts,
                    matches: _,
                } => {
                    if cache_mode == CacheMode::OnlyIfCached {
                        return Err(NotCached.into());
                    }
                    self.revalidate(entry, new_parts, header, body).await
                }
            },
            None => {
                if cache_mode == CacheMode::OnlyIfCached {
                    return Err(NotCached.into());
                }
                self.fetch_and_store(entry, request).await
            }
        }
    }

    /// Revalidates a stale entry with the origin. A not-modified answer refreshes the stored
    /// policy and keeps the cached body; anything else replaces the entry.
    async fn revalidate(
        &self,
        entry: Entry<'_>,
        parts: http::request::Parts,
        old_header: EntryHeader,
        old_body: SeekSlice<File>,
    ) -> Result<http::Response<StreamingOrLocal>, HttpRequestError> {
        let request = convert_request(self.client.clone(), parts)?;
        let response = self
            .client
            .execute(
                request
                    .try_clone()
                    .expect("a request without a body is always cloneable"),
            )
            .await?;
        let final_url = response.url().clone();

        match old_header
            .policy
            .after_response(&request, &response, SystemTime::now())
        {
            AfterResponse::NotModified(policy, parts) => {
                tracing::debug!(url=%final_url, "stale cache entry revalidated");
                let header = EntryHeader {
                    policy,
                    url: final_url.clone(),
                };
                let body = write_entry(entry.writer()?, &header, old_body)?;
                Ok(make_response(parts, local_body(body), final_url))
            }
            AfterResponse::Modified(policy, parts) => {
                tracing::debug!(url=%final_url, "stale cache entry changed upstream");
                drop(old_body);
                let header = EntryHeader {
                    policy,
                    url: final_url.clone(),
                };
                self.store_or_stream(entry, header, parts, response.bytes_stream(), final_url)
                    .await
            }
        }
    }

    /// First contact with a resource: fetch it and store the response when its policy allows.
    async fn fetch_and_store(
        &self,
        entry: Entry<'_>,
        request: reqwest::Request,
    ) -> Result<http::Response<StreamingOrLocal>, HttpRequestError> {
        let response = self
            .client
            .execute(
                request
                    .try_clone()
                    .expect("a request without a body is always cloneable"),
            )
            .await?
            .error_for_status()?;
        let final_url = response.url().clone();
        let response = convert_response(response);

        let policy = CachePolicy::new(&request, &response);
        let (parts, body) = response.into_parts();
        let header = EntryHeader {
            policy,
            url: final_url.clone(),
        };
        self.store_or_stream(entry, header, parts, body, final_url)
            .await
    }

    /// Either persists the body into the entry and serves it from disk, or, for uncacheable
    /// responses, drops the entry and streams the body through.
    async fn store_or_stream(
        &self,
        entry: Entry<'_>,
        header: EntryHeader,
        parts: http::response::Parts,
        body: impl Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
        final_url: Url,
    ) -> Result<http::Response<StreamingOrLocal>, HttpRequestError> {
        if header.policy.is_storable() {
            let body = write_entry_async(entry.writer()?, &header, body).await?;
            Ok(make_response(parts, local_body(body), final_url))
        } else {
            entry.discard()?;
            Ok(make_response(parts, streaming_body(body), final_url))
        }
    }
}

/// Assembles the response handed to callers; the final url rides along as an extension.
fn make_response(
    parts: http::response::Parts,
    body: StreamingOrLocal,
    url: Url,
) -> http::Response<StreamingOrLocal> {
    let mut response = http::Response::from_parts(parts, body);
    response.extensions_mut().insert(url);
    response
}

fn local_body(body: SeekSlice<File>) -> StreamingOrLocal {
    StreamingOrLocal::Local(Box::new(body))
}

fn streaming_body(
    stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
) -> StreamingOrLocal {
    StreamingOrLocal::Streaming(Box::new(
        stream
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .into_async_read()
            .compat(),
    ))
}

fn invalid_data(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Splits a cache entry into its header and a seekable view of the body that follows it.
fn open_entry(mut file: File) -> io::Result<(EntryHeader, SeekSlice<File>)> {
    let header: EntryHeader = ciborium::de::from_reader(&mut file).map_err(invalid_data)?;
    let body_start = file.stream_position()?;
    let body_end = file.seek(SeekFrom::End(0))?;
    let mut body = SeekSlice::new(file, body_start, body_end)?;
    body.rewind()?;
    Ok((header, body))
}

/// Writes header plus body into the entry and returns a view of the published body.
fn write_entry<R: Read>(
    mut writer: EntryWriter<'_>,
    header: &EntryHeader,
    mut body: R,
) -> io::Result<SeekSlice<File>> {
    ciborium::ser::into_writer(header, &mut writer).map_err(invalid_data)?;
    let body_start = writer.stream_position()?;
    io::copy(&mut body, &mut writer)?;
    let body_end = writer.stream_position()?;
    SeekSlice::new(writer.finish()?, body_start, body_end)
}

/// Like [`write_entry`] but drains an incoming network stream as the body.
async fn write_entry_async(
    mut writer: EntryWriter<'_>,
    header: &EntryHeader,
    mut body: impl Stream<Item = reqwest::Result<Bytes>> + Send + Unpin,
) -> io::Result<SeekSlice<File>> {
    ciborium::ser::into_writer(header, &mut writer).map_err(invalid_data)?;
    let body_start = writer.stream_position()?;
    while let Some(chunk) = body.next().await {
        writer.write_all(chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?.as_ref())?;
    }
    let body_end = writer.stream_position()?;
    SeekSlice::new(writer.finish()?, body_start, body_end)
}

/// Converts revalidation request parts back into a `reqwest::Request`.
fn convert_request(
    client: Client,
    parts: http::request::Parts,
) -> Result<reqwest::Request, reqwest::Error> {
    client
        .request(
            parts.method,
            Url::from_str(&parts.uri.to_string()).expect("uris should be the same"),
        )
        .headers(parts.headers)
        .version(parts.version)
        .build()
}

/// Converts a `reqwest::Response` into the `http::Response` shape the cache policy works with,
/// carrying the headers, extensions and final url over.
fn convert_response(
    mut response: reqwest::Response,
) -> http::response::Response<impl Stream<Item = reqwest::Result<Bytes>>> {
    let mut builder = http::Response::builder()
        .version(response.version())
        .status(response.status());

    let headers = builder.headers_mut().expect("the builder cannot have failed");
    *headers = std::mem::take(response.headers_mut());
    std::mem::swap(response.headers_mut(), headers);

    let extensions = builder.extensions_mut().expect("the builder cannot have failed");
    *extensions = std::mem::take(response.extensions_mut());
    extensions.insert(response.url().clone());

    builder
        .body(response.bytes_stream())
        .expect("building should never fail")
}
