use super::constraints::{ConstraintStore, PinId, ROOT_PIN};
use super::prefetch::Prefetcher;
use super::provider::{DependencyProvider, MetadataError};
use super::solve_options::ResolveOptions;
use crate::types::{
    CoreMetadata, Extra, MarkerEnvironment, NormalizedPackageName, PackageName, Requirement,
    Version,
};
use miette::Diagnostic;
use pep508_rs::VersionOrUrl;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Represents a single locked down distribution (python package) after calling [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedPackage {
    /// The name of the package
    pub name: NormalizedPackageName,

    /// The selected version
    pub version: Version,

    /// The extras that were selected either by the user or as part of the resolution, sorted.
    pub extras: Vec<Extra>,
}

/// The result of a successful resolution: one pinned version per package, ordered by canonical
/// name. Two resolutions of the same inputs against the same index contents yield the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// The pinned packages.
    pub packages: Vec<PinnedPackage>,
}

impl Resolution {
    /// Convenience accessor for tests and consumers that only care about the pinned pairs.
    pub fn pins(&self) -> Vec<(&str, &Version)> {
        self.packages
            .iter()
            .map(|p| (p.name.as_str(), &p.version))
            .collect()
    }
}

/// Why the requirements cannot be satisfied.
#[derive(Debug, Clone, Default)]
pub struct UnsatisfiableReport {
    /// The package whose allowed set became empty.
    pub package: String,

    /// The contributors (parent candidate and its requirement) that jointly exclude every
    /// version of the package.
    pub contributors: Vec<(String, String)>,

    /// Versions ruled out earlier, with the reason.
    pub forbidden: Vec<(Version, String)>,

    /// Set when the package does not exist in the index at all.
    pub no_such_package: bool,
}

impl Display for UnsatisfiableReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.package.is_empty() {
            return write!(f, "the requirements cannot be satisfied");
        }
        if self.no_such_package {
            writeln!(f, "package '{}' was not found in the index", self.package)?;
        } else {
            writeln!(
                f,
                "cannot find a version for package '{}' that satisfies all requirements",
                self.package
            )?;
        }
        if !self.contributors.is_empty() {
            writeln!(f, "the conflicting requirements are:")?;
            for (parent, requirement) in &self.contributors {
                writeln!(f, "  {parent} requires {requirement}")?;
            }
        }
        if !self.forbidden.is_empty() {
            writeln!(f, "versions ruled out while searching:")?;
            for (version, reason) in &self.forbidden {
                writeln!(f, "  {}: {}", version, reason)?;
            }
        }
        Ok(())
    }
}

/// An error produced by [`resolve`].
#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    /// No assignment satisfies all constraints under the available metadata.
    #[error("{0}")]
    Unsatisfiable(UnsatisfiableReport),

    /// The resolver only handles version-constrained requirements.
    #[error("direct URL requirements are not supported: {0}")]
    UnsupportedRequirement(String),

    /// A requirement named something that is not a valid package name.
    #[error("'{0}' is not a valid package name")]
    InvalidPackageName(String),

    /// A transport, io, or interpreter failure that aborts the resolution as a whole.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] MetadataError),
}

struct Frame {
    name: NormalizedPackageName,
    version: Version,
    pin_id: PinId,
}

enum Expansion {
    Committed,
    Conflict,
}

/// Resolves the given requirements against the provider into a pinned set of packages.
///
/// The engine is a single logical task: it mutates the constraint store and the decision stack
/// exclusively, suspending only for candidate listings, metadata fetches and sdist builds. The
/// speculative prefetcher may run concurrent fetches but those only populate the metadata cache.
pub async fn resolve(
    provider: Arc<dyn DependencyProvider>,
    requirements: impl IntoIterator<Item = &Requirement>,
    env_markers: &MarkerEnvironment,
    options: &ResolveOptions,
) -> Result<Resolution, ResolveError> {
    let mut solver = Solver {
        provider: provider.clone(),
        env: env_markers,
        options,
        store: ConstraintStore::new(env_markers.python_full_version.version.clone()),
        stack: Vec::new(),
        next_pin_id: ROOT_PIN + 1,
        pin_labels: HashMap::from([(ROOT_PIN, String::from("your requirements"))]),
        last_conflict: None,
        prefetcher: Prefetcher::new(
            provider,
            options.speculative_prefetch,
            options.prefetch_concurrency,
        ),
    };

    let result = solver.run(requirements).await;

    // Whatever happened, cancel outstanding speculative fetches and drain them before handing
    // back to the caller.
    solver.prefetcher.shutdown().await;

    result
}

struct Solver<'i> {
    provider: Arc<dyn DependencyProvider>,
    env: &'i MarkerEnvironment,
    options: &'i ResolveOptions,
    store: ConstraintStore,
    stack: Vec<Frame>,
    next_pin_id: PinId,
    pin_labels: HashMap<PinId, String>,
    last_conflict: Option<UnsatisfiableReport>,
    prefetcher: Prefetcher,
}

impl<'i> Solver<'i> {
    async fn run(
        &mut self,
        requirements: impl IntoIterator<Item = &Requirement>,
    ) -> Result<Resolution, ResolveError> {
        // The synthetic root contributes every user requirement. It is pinned by construction
        // and never unpins; popping past it means the requirements are unsatisfiable.
        for requirement in requirements {
            if !marker_applies(requirement, self.env, &[]) {
                continue;
            }
            if !self.add_requirement(ROOT_PIN, requirement).await? {
                self.backtrack()?;
            }
        }

        'solve: loop {
            let Some(name) = self.store.select(&self.options.pre_release_resolution) else {
                break;
            };

            loop {
                let Some(version) = self.store.choose(&name, &self.options.pre_release_resolution)
                else {
                    self.record_conflict(&name);
                    self.backtrack()?;
                    continue 'solve;
                };

                self.spawn_speculative_fetches(&name, &version);

                let files = self.store.files(&name, &version).to_vec();
                let metadata = match self.provider.metadata(&name, &version, &files).await {
                    Ok(metadata) => metadata,
                    Err(err) if err.forbids_candidate() => {
                        tracing::warn!("cannot use {name} {version}: {err}");
                        self.store.forbid(&name, &version, err.to_string());
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

                // The metadata itself may exclude the target interpreter even when the index
                // listing did not say so.
                if let Some(requires_python) = &metadata.requires_python {
                    if !requires_python.contains(self.store.python_version()) {
                        self.store.forbid(
                            &name,
                            &version,
                            format!("requires-python {requires_python} excludes the target interpreter"),
                        );
                        continue;
                    }
                }

                match self.expand(&name, version, &metadata).await? {
                    Expansion::Committed => continue 'solve,
                    Expansion::Conflict => {
                        self.backtrack()?;
                        continue 'solve;
                    }
                }
            }
        }

        let mut packages: Vec<PinnedPackage> = self
            .store
            .pinned_packages()
            .into_iter()
            .map(|(name, version, extras)| PinnedPackage {
                name,
                version,
                extras,
            })
            .collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Resolution { packages })
    }

    /// Commits to `version` for `name`: pins it and registers every applicable dependency of the
    /// metadata record with the store.
    async fn expand(
        &mut self,
        name: &NormalizedPackageName,
        version: Version,
        metadata: &CoreMetadata,
    ) -> Result<Expansion, ResolveError> {
        let pin_id = self.next_pin_id;
        self.next_pin_id += 1;
        self.pin_labels
            .insert(pin_id, format!("{} {}", name, version));
        self.store.pin(name, version.clone(), pin_id);
        self.stack.push(Frame {
            name: name.clone(),
            version,
            pin_id,
        });

        let demanded = self.store.extras_demanded(name);
        for extra in &demanded {
            if !metadata.extras.contains(extra) {
                tracing::warn!("{name} does not declare the requested extra '{extra}'");
            }
        }
        let extras_ctx: Vec<&str> = demanded.iter().map(Extra::as_str).collect();

        for requirement in &metadata.requires_dist {
            if !marker_applies(requirement, self.env, &extras_ctx) {
                continue;
            }
            if !self.add_requirement(pin_id, requirement).await? {
                return Ok(Expansion::Conflict);
            }
        }

        Ok(Expansion::Committed)
    }

    /// Registers a single requirement, fetching the candidate listing of its target on first
    /// contact. Returns `Ok(false)` if the store reported a conflict.
    ///
    /// When a requirement demands an extra of a package that is already pinned, the requirement
    /// group gated on that extra is expanded right here from the cached metadata; the worklist
    /// exists because those requirements can in turn demand further extras.
    async fn add_requirement(
        &mut self,
        parent: PinId,
        requirement: &Requirement,
    ) -> Result<bool, ResolveError> {
        let mut queue: Vec<(PinId, Requirement)> = vec![(parent, requirement.clone())];

        while let Some((parent, requirement)) = queue.pop() {
            if matches!(requirement.version_or_url, Some(VersionOrUrl::Url(_))) {
                return Err(ResolveError::UnsupportedRequirement(requirement.to_string()));
            }
            let name: NormalizedPackageName = PackageName::from_str(&requirement.name)
                .map_err(|_| ResolveError::InvalidPackageName(requirement.name.clone()))?
                .into();

            if !self.store.contains(&name) {
                match self.provider.available_versions(&name).await {
                    Ok(available) => self.store.register_available(name.clone(), available),
                    Err(MetadataError::NoSuchPackage(_)) => {
                        // Fatal: surface as unsatisfiable, rooted at the contributor.
                        return Err(ResolveError::Unsatisfiable(UnsatisfiableReport {
                            package: name.to_string(),
                            contributors: vec![(
                                self.pin_label(parent),
                                requirement.to_string(),
                            )],
                            forbidden: Vec::new(),
                            no_such_package: true,
                        }));
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let outcome = self.store.add(parent, &name, &requirement);
            if outcome.conflict {
                self.record_conflict(&name);
                return Ok(false);
            }

            if !outcome.new_extras.is_empty() {
                if let Some((version, own_pin)) = self.store.pinned_of(&name) {
                    let files = self.store.files(&name, &version).to_vec();
                    let metadata = self.provider.metadata(&name, &version, &files).await?;
                    for gated in
                        newly_gated_requirements(&metadata, self.env, &outcome.new_extras)
                    {
                        queue.push((own_pin, gated));
                    }
                }
            }
        }

        Ok(true)
    }

    /// Pops the most recent pin, withdraws its contributions and forbids the popped version.
    /// Popping past the synthetic root terminates the resolution as unsatisfiable.
    fn backtrack(&mut self) -> Result<(), ResolveError> {
        let Some(frame) = self.stack.pop() else {
            return Err(ResolveError::Unsatisfiable(
                self.last_conflict.take().unwrap_or_default(),
            ));
        };

        tracing::debug!("backtracking: unpinning {} {}", frame.name, frame.version);
        self.store.remove(frame.pin_id);
        self.store.unpin(&frame.name);
        self.pin_labels.remove(&frame.pin_id);

        let reason = match &self.last_conflict {
            Some(conflict) => format!(
                "selecting it leads to an impossible set of constraints on '{}'",
                conflict.package
            ),
            None => String::from("selecting it leads to an impossible set of constraints"),
        };
        self.store.forbid(&frame.name, &frame.version, reason);

        Ok(())
    }

    /// Snapshots the contributors of the conflicted package for the final explanation. Only the
    /// contributors that actually narrow the version set are kept, unless none of them do.
    ///
    /// A conflict whose allowed set is only empty because of forbidden versions is a downstream
    /// echo of an earlier contradiction; the earlier report is the more useful one and is kept.
    fn record_conflict(&mut self, name: &NormalizedPackageName) {
        if self.last_conflict.is_some() && !self.store.allowed(name).is_empty() {
            return;
        }

        let state = self.store.state(name);

        let narrowing: Vec<_> = state
            .contributors
            .iter()
            .filter(|(_, req)| req.version_or_url.is_some())
            .collect();
        let relevant = if narrowing.is_empty() {
            state.contributors.iter().collect()
        } else {
            narrowing
        };

        let contributors = relevant
            .into_iter()
            .map(|(pin, req)| (self.pin_label(*pin), req.to_string()))
            .collect();
        let forbidden = state
            .forbidden
            .iter()
            .map(|(version, reason)| (version.clone(), reason.clone()))
            .collect();

        self.last_conflict = Some(UnsatisfiableReport {
            package: name.to_string(),
            contributors,
            forbidden,
            no_such_package: false,
        });
    }

    fn pin_label(&self, pin: PinId) -> String {
        self.pin_labels
            .get(&pin)
            .cloned()
            .unwrap_or_else(|| String::from("a withdrawn candidate"))
    }

    /// While the upcoming metadata fetch is in flight, warm the cache for the top candidate of
    /// every other open package and for the runner-up of the current one (in case the chosen
    /// version is rejected).
    fn spawn_speculative_fetches(&mut self, current: &NormalizedPackageName, version: &Version) {
        if !self.options.speculative_prefetch {
            return;
        }

        let policy = &self.options.pre_release_resolution;
        let mut targets: Vec<(NormalizedPackageName, Version)> = Vec::new();

        for other in self.store.unpinned_with_contributors() {
            if &other == current {
                if let Some(next) = self
                    .store
                    .candidates(&other, policy)
                    .into_iter()
                    .find(|v| v != version)
                {
                    targets.push((other, next));
                }
            } else if let Some(best) = self.store.choose(&other, policy) {
                targets.push((other, best));
            }
        }

        for (name, version) in targets {
            let files = self.store.files(&name, &version).to_vec();
            self.prefetcher.spawn(name, version, files);
        }
    }
}

fn marker_applies(requirement: &Requirement, env: &MarkerEnvironment, extras: &[&str]) -> bool {
    match &requirement.marker {
        None => true,
        Some(marker) => marker.evaluate(env, extras),
    }
}

/// The requirements of `metadata` that only apply because one of `new_extras` is now demanded:
/// their marker holds under the new extras but not without them.
fn newly_gated_requirements(
    metadata: &CoreMetadata,
    env: &MarkerEnvironment,
    new_extras: &[Extra],
) -> Vec<Requirement> {
    let extras: Vec<&str> = new_extras.iter().map(Extra::as_str).collect();
    metadata
        .requires_dist
        .iter()
        .filter(|req| match &req.marker {
            None => false,
            Some(marker) => marker.evaluate(env, &extras) && !marker.evaluate(env, &[]),
        })
        .cloned()
        .collect()
}
