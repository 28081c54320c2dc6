//! The resolver core: given a set of requirements it discovers candidate versions, narrows them
//! through the accumulated constraints and commits to versions one package at a time, backtracking
//! on conflict, until every requirement is satisfied by a pinned `(name, version)` pair.

mod constraints;
mod fixup;
mod prefetch;
mod provider;
mod solve;
mod solve_options;

pub use fixup::parse_requirement_fixup;
pub use provider::{DependencyProvider, MetadataError, PypiDependencyProvider};
pub use solve::{resolve, PinnedPackage, Resolution, ResolveError, UnsatisfiableReport};
pub use solve_options::{BuildExecutor, PreReleaseResolution, ResolveOptions};
