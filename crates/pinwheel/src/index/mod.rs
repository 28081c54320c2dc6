//! This module contains functions for working with package indexes that implement the PyPA
//! simple repository API.

mod cache;
mod http;
mod package_database;
mod wheel_metadata;

pub use cache::{CacheKey, CacheStore};
pub use http::{CacheMode, Http, HttpRequestError};
pub use package_database::{PackageDb, PackageDbError, VersionArtifacts};
