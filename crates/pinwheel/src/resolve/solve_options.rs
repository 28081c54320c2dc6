//! Contains the options that can be passed to the [`super::solve::resolve`] function.

use crate::python_env::PythonLocation;
use pep508_rs::{Requirement, VersionOrUrl};
use std::collections::HashMap;

/// Defines where source distribution builds run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExecutor {
    /// Run builds on the blocking thread pool, at most `limit` at a time.
    Pool {
        /// Maximum number of concurrent builds.
        limit: usize,
    },

    /// Run builds inline on the calling task. This blocks the resolver while a build runs and
    /// exists to make test runs deterministic.
    Synchronous,
}

impl Default for BuildExecutor {
    fn default() -> Self {
        BuildExecutor::Pool { limit: 4 }
    }
}

/// Defines how pre-releases are handled during package resolution.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PreReleaseResolution {
    /// Don't allow pre-releases to be selected during resolution
    Disallow,

    /// Conditionally allow pre-releases to be selected during resolution. This
    /// behavior emulates `pip`'s pre-release resolution, which is not according
    /// to "spec" but the most widely used logic.
    ///
    /// It works as follows:
    ///
    /// - if the accumulated specifiers of a package admit no stable release (for example because
    ///   the specifier is `==1.0.0b1`, or because the package only ever published pre-releases),
    ///   pre-releases become eligible for that package;
    /// - any name in the `allow_names` list allows pre-releases outright. This is usually derived
    ///   from the specs given by the user: asking for `foo>0.0.0b0` enables pre-releases for
    ///   `foo`, also as a transitive dependency.
    AllowIfNoOtherVersionsOrEnabled {
        /// A list of package names that will allow pre-releases to be selected
        allow_names: Vec<String>,
    },

    /// Allow any pre-releases to be selected during resolution
    Allow,
}

impl Default for PreReleaseResolution {
    fn default() -> Self {
        PreReleaseResolution::AllowIfNoOtherVersionsOrEnabled {
            allow_names: Vec::new(),
        }
    }
}

impl PreReleaseResolution {
    /// Return a AllowIfNoOtherVersionsOrEnabled variant from a list of requirements
    pub fn from_specs(specs: &[Requirement]) -> Self {
        let mut allow_names = Vec::new();
        for spec in specs {
            match &spec.version_or_url {
                Some(VersionOrUrl::VersionSpecifier(v)) => {
                    if v.iter().any(|s| s.version().any_prerelease()) {
                        if let Ok(name) = spec.name.parse::<crate::types::PackageName>() {
                            allow_names.push(name.as_str().to_string());
                        }
                    }
                }
                _ => continue,
            };
        }
        PreReleaseResolution::AllowIfNoOtherVersionsOrEnabled { allow_names }
    }
}

/// Additional options that may influence the resolution. In general passing [`Default::default`]
/// to the [`super::resolve`] function should provide sane defaults, however if you want to fine
/// tune the resolver you can do so via this struct.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// When set, dependency information is read from the wheels themselves (PEP 658 sidecars or
    /// range requests into the archive). When unset, the per-release JSON document of the index
    /// is used instead and no artifact is touched for packages that ship wheels.
    pub download_wheels: bool,

    /// Defines whether pre-releases are allowed to be selected during resolution. By default
    /// pre-releases are only selected if there is no other option.
    pub pre_release_resolution: PreReleaseResolution,

    /// Defines what python interpreter to use to run the build backend of source distributions.
    pub python_location: PythonLocation,

    /// Where sdist builds run. The synchronous executor makes the resolver fully deterministic
    /// at the cost of blocking on every build.
    pub executor: BuildExecutor,

    /// Whether the resolver may speculatively fetch metadata of promising candidates while it
    /// waits for the candidate it actually chose. Purely an optimization, the resolution outcome
    /// does not depend on it.
    pub speculative_prefetch: bool,

    /// Bounds the number of concurrent speculative fetches.
    pub prefetch_concurrency: usize,

    /// Extra environment variables for the build backend subprocess.
    pub env_variables: HashMap<String, String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            download_wheels: true,
            pre_release_resolution: PreReleaseResolution::default(),
            python_location: PythonLocation::default(),
            executor: BuildExecutor::default(),
            speculative_prefetch: true,
            prefetch_concurrency: 16,
            env_variables: HashMap::new(),
        }
    }
}
