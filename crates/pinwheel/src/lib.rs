//! Pinwheel resolves PyPI requirements into a fully pinned, internally
//! consistent set of packages. It is not a package manager itself but
//! provides the resolver plumbing to be used in one: candidate discovery
//! through the simple index, metadata acquisition (wheel fast path and
//! sdist builds) and a deterministic backtracking solver.

#![deny(missing_docs)]

/// Contains the types that are used throughout the library.
pub mod types;

pub mod index;
pub mod resolve;
pub mod sdist_builder;

pub mod python_env;
pub mod tags;

mod utils;

pub use resolve::{
    parse_requirement_fixup, resolve, DependencyProvider, MetadataError, PinnedPackage,
    PypiDependencyProvider, Resolution, ResolveError,
};
pub use resolve::{BuildExecutor, PreReleaseResolution, ResolveOptions};

pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::{MarkerEnvironment, Requirement};
pub use utils::normalize_index_url;
