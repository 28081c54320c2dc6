//! The constraint store: per-package bookkeeping of who demands what, which versions remain
//! allowed, and which versions have been ruled out while searching.

use crate::index::VersionArtifacts;
use crate::resolve::solve_options::PreReleaseResolution;
use crate::types::{ArtifactInfo, Extra, NormalizedPackageName, Requirement, Version};
use indexmap::{IndexMap, IndexSet};
use pep508_rs::VersionOrUrl;
use std::str::FromStr;
use std::sync::Arc;

/// Identifies one pin action. Contributions are withdrawn by this id when the pin is popped off
/// the decision stack. Ids increase monotonically over the lifetime of a resolution, the synthetic
/// root is id 0 and is never withdrawn.
pub(crate) type PinId = usize;

/// The pin id of the synthetic root that contributes the user requirements.
pub(crate) const ROOT_PIN: PinId = 0;

/// The state of a single package during resolution. Created on the first contribution and kept
/// until the resolution terminates.
pub(crate) struct PackageState {
    /// Everyone that currently narrows this package: the contributing pin and its requirement.
    pub contributors: Vec<(PinId, Requirement)>,

    /// The union of the extras demanded by the contributors.
    pub extras_demanded: IndexSet<Extra>,

    /// The committed version, if any, together with the pin id of the commitment.
    pub pinned: Option<(Version, PinId)>,

    /// Versions known to fail under the current partial state, with the reason they failed.
    pub forbidden: IndexMap<Version, String>,

    /// Every published version with its release files, newest first.
    pub available: Arc<VersionArtifacts>,
}

/// What [`ConstraintStore::add`] observed.
pub(crate) struct AddOutcome {
    /// Extras that were not demanded of this package before this contribution.
    pub new_extras: Vec<Extra>,

    /// True iff the store is now inconsistent for this package: the allowed set is empty, or it
    /// excludes the pinned version.
    pub conflict: bool,
}

/// Accumulates the requirements contributed for each package and answers which versions remain
/// allowed. Adding a contribution only ever shrinks the allowed set; [`ConstraintStore::remove`]
/// withdraws every contribution of a popped pin.
pub(crate) struct ConstraintStore {
    packages: IndexMap<NormalizedPackageName, PackageState>,
    python_version: Version,
}

impl ConstraintStore {
    pub fn new(python_version: Version) -> Self {
        Self {
            packages: IndexMap::new(),
            python_version,
        }
    }

    pub fn python_version(&self) -> &Version {
        &self.python_version
    }

    pub fn contains(&self, name: &NormalizedPackageName) -> bool {
        self.packages.contains_key(name)
    }

    pub fn state(&self, name: &NormalizedPackageName) -> &PackageState {
        &self.packages[name]
    }

    /// Creates the state for a package from the candidate listing of the index. Must happen
    /// before the first contribution for that package.
    pub fn register_available(
        &mut self,
        name: NormalizedPackageName,
        available: Arc<VersionArtifacts>,
    ) {
        self.packages.entry(name).or_insert_with(|| PackageState {
            contributors: Vec::new(),
            extras_demanded: IndexSet::new(),
            pinned: None,
            forbidden: IndexMap::new(),
            available,
        });
    }

    /// Records that `parent` contributes `requirement` to the named package and reports, for this
    /// single call, whether the package became inconsistent.
    pub fn add(
        &mut self,
        parent: PinId,
        name: &NormalizedPackageName,
        requirement: &Requirement,
    ) -> AddOutcome {
        let state = self
            .packages
            .get_mut(name)
            .expect("contributions require registered availability");

        state.contributors.push((parent, requirement.clone()));

        let mut new_extras = Vec::new();
        for extra in requirement.extras.iter().flatten() {
            let Ok(extra) = Extra::from_str(extra) else {
                continue;
            };
            if state.extras_demanded.insert(extra.clone()) {
                new_extras.push(extra);
            }
        }

        AddOutcome {
            new_extras,
            conflict: self.conflict(name),
        }
    }

    /// Withdraws every contribution made by `parent`. A package whose last contributor disappears
    /// also forgets its forbidden versions: those were only known to fail under constraints that
    /// no longer exist.
    pub fn remove(&mut self, parent: PinId) {
        for state in self.packages.values_mut() {
            let before = state.contributors.len();
            state.contributors.retain(|(pin, _)| *pin != parent);
            if state.contributors.len() == before {
                continue;
            }

            state.extras_demanded = state
                .contributors
                .iter()
                .flat_map(|(_, req)| req.extras.iter().flatten())
                .filter_map(|extra| Extra::from_str(extra).ok())
                .collect();

            if state.contributors.is_empty() {
                state.forbidden.clear();
            }
        }
    }

    pub fn pin(&mut self, name: &NormalizedPackageName, version: Version, pin: PinId) {
        let state = self
            .packages
            .get_mut(name)
            .expect("cannot pin an unknown package");
        debug_assert!(state.pinned.is_none());
        state.pinned = Some((version, pin));
    }

    pub fn unpin(&mut self, name: &NormalizedPackageName) {
        if let Some(state) = self.packages.get_mut(name) {
            state.pinned = None;
        }
    }

    pub fn pinned_of(&self, name: &NormalizedPackageName) -> Option<(Version, PinId)> {
        self.packages.get(name).and_then(|s| s.pinned.clone())
    }

    pub fn forbid(&mut self, name: &NormalizedPackageName, version: &Version, reason: String) {
        if let Some(state) = self.packages.get_mut(name) {
            state.forbidden.insert(version.clone(), reason);
        }
    }

    /// True iff the allowed set of the package is empty, or excludes the currently pinned version.
    pub fn conflict(&self, name: &NormalizedPackageName) -> bool {
        let Some(state) = self.packages.get(name) else {
            return false;
        };
        if let Some((pinned, _)) = &state.pinned {
            return !state
                .contributors
                .iter()
                .all(|(_, req)| specifier_admits(req, pinned));
        }
        if state.contributors.is_empty() {
            return false;
        }
        self.allowed(name).is_empty()
    }

    /// The versions admitted by the conjunction of all contributors, restricted to versions with
    /// at least one usable file for the target interpreter. Newest first. Forbidden versions are
    /// not filtered here, the choose step takes care of those.
    pub fn allowed(&self, name: &NormalizedPackageName) -> Vec<Version> {
        let Some(state) = self.packages.get(name) else {
            return Vec::new();
        };
        state
            .available
            .iter()
            .filter(|(version, files)| self.version_admissible(state, version, files))
            .map(|(version, _)| version.clone())
            .collect()
    }

    /// The versions the choose step may actually try: allowed, not forbidden, stable releases
    /// first and pre-releases only when the policy admits them.
    pub fn candidates(
        &self,
        name: &NormalizedPackageName,
        policy: &PreReleaseResolution,
    ) -> Vec<Version> {
        let Some(state) = self.packages.get(name) else {
            return Vec::new();
        };

        let mut stable = Vec::new();
        let mut pre = Vec::new();
        for (version, files) in state.available.iter() {
            if state.forbidden.contains_key(version)
                || !self.version_admissible(state, version, files)
            {
                continue;
            }
            if version.any_prerelease() {
                pre.push(version.clone());
            } else {
                stable.push(version.clone());
            }
        }

        let admit_pre = match policy {
            PreReleaseResolution::Allow => true,
            PreReleaseResolution::Disallow => false,
            PreReleaseResolution::AllowIfNoOtherVersionsOrEnabled { allow_names } => {
                stable.is_empty() || allow_names.iter().any(|n| n == name.as_str())
            }
        };
        if admit_pre {
            stable.append(&mut pre);
        }
        stable
    }

    /// The highest candidate, or `None` which means it is time to backtrack.
    pub fn choose(
        &self,
        name: &NormalizedPackageName,
        policy: &PreReleaseResolution,
    ) -> Option<Version> {
        self.candidates(name, policy).into_iter().next()
    }

    /// Picks the unpinned package to work on next: the one with the fewest candidate versions
    /// (most constrained first), ties broken by canonical name for determinism. Returns `None`
    /// when every package with contributors is pinned, which terminates the resolution.
    pub fn select(&self, policy: &PreReleaseResolution) -> Option<NormalizedPackageName> {
        self.packages
            .iter()
            .filter(|(_, state)| state.pinned.is_none() && !state.contributors.is_empty())
            .map(|(name, _)| (self.candidates(name, policy).len(), name))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, name)| name.clone())
    }

    /// The release files of a single version.
    pub fn files(&self, name: &NormalizedPackageName, version: &Version) -> &[ArtifactInfo] {
        self.packages
            .get(name)
            .and_then(|state| state.available.get(version))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn extras_demanded(&self, name: &NormalizedPackageName) -> Vec<Extra> {
        self.packages
            .get(name)
            .map(|state| {
                let mut extras: Vec<_> = state.extras_demanded.iter().cloned().collect();
                extras.sort();
                extras
            })
            .unwrap_or_default()
    }

    /// Every unpinned package that currently has contributors, in store order.
    pub fn unpinned_with_contributors(&self) -> Vec<NormalizedPackageName> {
        self.packages
            .iter()
            .filter(|(_, state)| state.pinned.is_none() && !state.contributors.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The final assignment: every pinned package with its demanded extras.
    pub fn pinned_packages(&self) -> Vec<(NormalizedPackageName, Version, Vec<Extra>)> {
        self.packages
            .iter()
            .filter_map(|(name, state)| {
                state
                    .pinned
                    .as_ref()
                    .map(|(version, _)| (name.clone(), version.clone(), self.extras_demanded(name)))
            })
            .collect()
    }

    fn version_admissible(
        &self,
        state: &PackageState,
        version: &Version,
        files: &[ArtifactInfo],
    ) -> bool {
        if !state
            .contributors
            .iter()
            .all(|(_, req)| specifier_admits(req, version))
        {
            return false;
        }

        // At least one file must not be yanked and must support the target interpreter.
        files.iter().any(|file| {
            !file.yanked.yanked
                && file
                    .requires_python
                    .as_ref()
                    .map_or(true, |rp| rp.contains(&self.python_version))
        })
    }
}

fn specifier_admits(requirement: &Requirement, version: &Version) -> bool {
    match &requirement.version_or_url {
        None => true,
        Some(VersionOrUrl::VersionSpecifier(specifiers)) => specifiers.contains(version),
        // Direct url requirements are rejected before they reach the store.
        Some(VersionOrUrl::Url(_)) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{ArtifactName, SDistFilename, SDistFormat, Yanked};
    use std::str::FromStr;

    fn sdist_file(name: &str, version: &str) -> ArtifactInfo {
        let version: Version = version.parse().unwrap();
        ArtifactInfo {
            filename: ArtifactName::SDist(SDistFilename {
                distribution: name.parse().unwrap(),
                version: version.clone(),
                format: SDistFormat::TarGz,
            }),
            url: format!("https://example.com/{name}-{version}.tar.gz")
                .parse()
                .unwrap(),
            hashes: None,
            requires_python: None,
            dist_info_metadata: Default::default(),
            yanked: Yanked::default(),
        }
    }

    fn store_with(name: &str, versions: &[&str]) -> (ConstraintStore, NormalizedPackageName) {
        let mut store = ConstraintStore::new("3.10.4".parse().unwrap());
        let normalized: NormalizedPackageName = name.parse().unwrap();
        let mut available = VersionArtifacts::new();
        for version in versions {
            available.insert(version.parse().unwrap(), vec![sdist_file(name, version)]);
        }
        available.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        store.register_available(normalized.clone(), Arc::new(available));
        (store, normalized)
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    #[test]
    fn test_add_narrows_allowed_set() {
        let (mut store, name) = store_with("foo", &["1.0", "1.5", "2.0"]);
        let policy = PreReleaseResolution::default();

        let outcome = store.add(ROOT_PIN, &name, &req("foo<2"));
        assert!(!outcome.conflict);
        assert_eq!(
            store.candidates(&name, &policy),
            vec!["1.5".parse::<Version>().unwrap(), "1.0".parse().unwrap()]
        );

        let outcome = store.add(1, &name, &req("foo>=1.2"));
        assert!(!outcome.conflict);
        assert_eq!(store.choose(&name, &policy), Some("1.5".parse().unwrap()));
    }

    #[test]
    fn test_conflicting_specifiers() {
        let (mut store, name) = store_with("foo", &["1.0", "2.0"]);
        assert!(!store.add(ROOT_PIN, &name, &req("foo<2")).conflict);
        assert!(store.add(1, &name, &req("foo>=2")).conflict);
    }

    #[test]
    fn test_conflict_with_pinned_version() {
        let (mut store, name) = store_with("foo", &["1.0", "2.0"]);
        store.add(ROOT_PIN, &name, &req("foo"));
        store.pin(&name, "2.0".parse().unwrap(), 1);
        assert!(!store.conflict(&name));
        assert!(store.add(2, &name, &req("foo<2")).conflict);
    }

    #[test]
    fn test_remove_restores_allowed_set_and_drops_forbidden() {
        let (mut store, name) = store_with("foo", &["1.0", "2.0"]);
        let policy = PreReleaseResolution::default();

        store.add(1, &name, &req("foo<2"));
        store.forbid(&name, &"1.0".parse().unwrap(), String::from("broken"));
        assert!(store.candidates(&name, &policy).is_empty());

        store.remove(1);
        // No contributors left, so the forbidden set was dropped too.
        assert_eq!(store.candidates(&name, &policy).len(), 2);
    }

    #[test]
    fn test_prereleases_admitted_only_without_stable_option() {
        let (mut store, name) = store_with("foo", &["1.0", "2.0b1"]);
        let policy = PreReleaseResolution::default();

        store.add(ROOT_PIN, &name, &req("foo"));
        // A stable release exists, the pre-release is not eligible.
        assert_eq!(store.choose(&name, &policy), Some("1.0".parse().unwrap()));

        store.add(1, &name, &req("foo>=2.0b1"));
        // Now only the pre-release satisfies the specifiers.
        assert_eq!(store.choose(&name, &policy), Some("2.0b1".parse().unwrap()));
    }

    #[test]
    fn test_yanked_versions_are_not_allowed() {
        let mut store = ConstraintStore::new("3.10.4".parse().unwrap());
        let name: NormalizedPackageName = "foo".parse().unwrap();
        let mut yanked = sdist_file("foo", "2.0");
        yanked.yanked = Yanked {
            yanked: true,
            reason: None,
        };
        let mut available = VersionArtifacts::new();
        available.insert("2.0".parse().unwrap(), vec![yanked]);
        available.insert("1.0".parse().unwrap(), vec![sdist_file("foo", "1.0")]);
        store.register_available(name.clone(), Arc::new(available));

        store.add(ROOT_PIN, &name, &req("foo"));
        assert_eq!(
            store.choose(&name, &PreReleaseResolution::default()),
            Some("1.0".parse().unwrap())
        );
    }

    #[test]
    fn test_requires_python_restricts_versions() {
        let mut store = ConstraintStore::new("3.8.0".parse().unwrap());
        let name: NormalizedPackageName = "foo".parse().unwrap();
        let mut too_new = sdist_file("foo", "2.0");
        too_new.requires_python = Some(">=3.10".parse().unwrap());
        let mut available = VersionArtifacts::new();
        available.insert("2.0".parse().unwrap(), vec![too_new]);
        available.insert("1.0".parse().unwrap(), vec![sdist_file("foo", "1.0")]);
        store.register_available(name.clone(), Arc::new(available));

        store.add(ROOT_PIN, &name, &req("foo"));
        assert_eq!(
            store.choose(&name, &PreReleaseResolution::default()),
            Some("1.0".parse().unwrap())
        );
    }

    #[test]
    fn test_select_most_constrained_with_name_tiebreak() {
        let mut store = ConstraintStore::new("3.10.4".parse().unwrap());
        let policy = PreReleaseResolution::default();

        for (name, versions) in [
            ("zoo", vec!["1.0"]),
            ("bar", vec!["1.0", "2.0"]),
            ("abc", vec!["1.0"]),
        ] {
            let normalized: NormalizedPackageName = name.parse().unwrap();
            let mut available = VersionArtifacts::new();
            for version in versions {
                available.insert(version.parse().unwrap(), vec![sdist_file(name, version)]);
            }
            store.register_available(normalized.clone(), Arc::new(available));
            store.add(ROOT_PIN, &normalized, &req(name));
        }

        // "abc" and "zoo" both have a single candidate, the name breaks the tie.
        assert_eq!(store.select(&policy), Some("abc".parse().unwrap()));
    }

    #[test]
    fn test_extras_demanded_accumulate_and_recede() {
        let (mut store, name) = store_with("foo", &["1.0"]);
        let outcome = store.add(7, &name, &req("foo[security,tests]"));
        assert_eq!(outcome.new_extras.len(), 2);
        let outcome = store.add(8, &name, &req("foo[security]"));
        assert!(outcome.new_extras.is_empty());

        store.remove(7);
        assert_eq!(store.extras_demanded(&name).len(), 1);
    }
}
