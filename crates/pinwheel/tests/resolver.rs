//! End-to-end resolver tests against an in-memory index snapshot. The snapshot data mirrors what
//! the real index served at the time the expected pin lists were recorded; using a static
//! provider keeps the tests hermetic and lets them count metadata acquisitions.

use async_trait::async_trait;
use indexmap::IndexMap;
use pinwheel::index::VersionArtifacts;
use pinwheel::types::{
    ArtifactInfo, ArtifactName, CoreMetadata, MarkerEnvironment, NormalizedPackageName, Requirement,
    Version, Yanked,
};
use pinwheel::{
    resolve, BuildExecutor, DependencyProvider, MetadataError, PreReleaseResolution, Resolution,
    ResolveError, ResolveOptions,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Returns a `MarkerEnvironment` for a CPython 3.10 on Linux.
fn linux_environment_markers() -> MarkerEnvironment {
    MarkerEnvironment {
        implementation_name: "cpython".to_string(),
        implementation_version: "3.10.4".parse().unwrap(),
        os_name: "posix".to_string(),
        platform_machine: "x86_64".to_string(),
        platform_python_implementation: "CPython".to_string(),
        platform_release: "5.15.0".to_string(),
        platform_system: "Linux".to_string(),
        platform_version: "#1 SMP".to_string(),
        python_full_version: "3.10.4".parse().unwrap(),
        python_version: "3.10".parse().unwrap(),
        sys_platform: "linux".to_string(),
    }
}

fn core_metadata(
    name: &str,
    version: &str,
    requires: &[&str],
    extras: &[&str],
    requires_python: Option<&str>,
) -> CoreMetadata {
    let mut buf = format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n");
    if let Some(requires_python) = requires_python {
        buf.push_str(&format!("Requires-Python: {requires_python}\n"));
    }
    for requirement in requires {
        buf.push_str(&format!("Requires-Dist: {requirement}\n"));
    }
    for extra in extras {
        buf.push_str(&format!("Provides-Extra: {extra}\n"));
    }
    CoreMetadata::try_from(buf.as_bytes()).expect("the test metadata must parse")
}

/// An in-memory index snapshot plus the [`DependencyProvider`] over it. Metadata for releases
/// registered as sdist-only counts as a build; the provider keeps its own metadata cache like the
/// production provider does, so a second resolution builds nothing.
#[derive(Default)]
struct StaticIndex {
    releases: HashMap<NormalizedPackageName, VersionArtifacts>,
    metadata: HashMap<(NormalizedPackageName, Version), CoreMetadata>,
    sdist_releases: HashSet<(NormalizedPackageName, Version)>,
}

impl StaticIndex {
    fn with_wheel(mut self, name: &str, version: &str, requires: &[&str]) -> Self {
        self.add(name, version, requires, &[], None, false);
        self
    }

    fn with_wheel_full(
        mut self,
        name: &str,
        version: &str,
        requires: &[&str],
        extras: &[&str],
        requires_python: Option<&str>,
    ) -> Self {
        self.add(name, version, requires, extras, requires_python, false);
        self
    }

    fn with_sdist(mut self, name: &str, version: &str, requires: &[&str]) -> Self {
        self.add(name, version, requires, &[], None, true);
        self
    }

    fn add(
        &mut self,
        name: &str,
        version: &str,
        requires: &[&str],
        extras: &[&str],
        requires_python: Option<&str>,
        sdist: bool,
    ) {
        let normalized: NormalizedPackageName = name.parse().unwrap();
        let parsed_version: Version = version.parse().unwrap();

        let filename = if sdist {
            format!("{name}-{version}.tar.gz")
        } else {
            format!("{name}-{version}-py3-none-any.whl")
        };
        let artifact = ArtifactInfo {
            filename: ArtifactName::from_filename(&filename, &normalized).unwrap(),
            url: format!("https://files.example.com/{filename}").parse().unwrap(),
            hashes: None,
            requires_python: None,
            dist_info_metadata: Default::default(),
            yanked: Yanked::default(),
        };

        self.releases
            .entry(normalized.clone())
            .or_default()
            .entry(parsed_version.clone())
            .or_default()
            .push(artifact);
        self.metadata.insert(
            (normalized.clone(), parsed_version.clone()),
            core_metadata(name, version, requires, extras, requires_python),
        );
        if sdist {
            self.sdist_releases.insert((normalized, parsed_version));
        }
    }

    fn provider(mut self) -> Arc<StaticProvider> {
        for versions in self.releases.values_mut() {
            versions.sort_unstable_by(|v1, _, v2, _| v2.cmp(v1));
        }
        Arc::new(StaticProvider {
            releases: self
                .releases
                .into_iter()
                .map(|(name, versions)| (name, Arc::new(versions)))
                .collect(),
            metadata: self.metadata,
            sdist_releases: self.sdist_releases,
            cache: Mutex::new(HashMap::new()),
            build_count: Mutex::new(HashMap::new()),
        })
    }
}

struct StaticProvider {
    releases: HashMap<NormalizedPackageName, Arc<VersionArtifacts>>,
    metadata: HashMap<(NormalizedPackageName, Version), CoreMetadata>,
    sdist_releases: HashSet<(NormalizedPackageName, Version)>,
    cache: Mutex<HashMap<(NormalizedPackageName, Version), CoreMetadata>>,
    build_count: Mutex<HashMap<(NormalizedPackageName, Version), usize>>,
}

impl StaticProvider {
    fn builds_of(&self, name: &str, version: &str) -> usize {
        let key = (
            name.parse().unwrap(),
            Version::from_str(version).unwrap(),
        );
        self.build_count.lock().unwrap().get(&key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DependencyProvider for StaticProvider {
    async fn available_versions(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<Arc<VersionArtifacts>, MetadataError> {
        self.releases
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::NoSuchPackage(name.clone()))
    }

    async fn metadata(
        &self,
        name: &NormalizedPackageName,
        version: &Version,
        _files: &[ArtifactInfo],
    ) -> Result<CoreMetadata, MetadataError> {
        let key = (name.clone(), version.clone());

        // The lock is held for the entire acquisition, mirroring the per-key serialization of
        // the real sdist builder: concurrent requests for the same key observe one build.
        let mut cache = self.cache.lock().unwrap();
        if let Some(metadata) = cache.get(&key) {
            return Ok(metadata.clone());
        }

        let metadata = self
            .metadata
            .get(&key)
            .cloned()
            .ok_or_else(|| MetadataError::NoUsableArtifact(name.clone(), version.clone()))?;
        if self.sdist_releases.contains(&key) {
            *self.build_count.lock().unwrap().entry(key.clone()).or_default() += 1;
        }
        cache.insert(key, metadata.clone());
        Ok(metadata)
    }
}

fn requirements(specs: &[&str]) -> Vec<Requirement> {
    specs
        .iter()
        .map(|s| Requirement::from_str(s).unwrap())
        .collect()
}

fn pins(resolution: &Resolution) -> Vec<(String, String)> {
    resolution
        .packages
        .iter()
        .map(|p| (p.name.to_string(), p.version.to_string()))
        .collect()
}

fn expected(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

async fn resolve_with(
    provider: Arc<StaticProvider>,
    specs: &[&str],
    options: &ResolveOptions,
) -> Result<Resolution, ResolveError> {
    let requirements = requirements(specs);
    resolve(
        provider,
        &requirements,
        &linux_environment_markers(),
        options,
    )
    .await
}

/// Simplest case, doesn't use any sdists. The snapshot mirrors the pandas 1.5.2 dependency tree.
#[tokio::test]
async fn test_pandas() {
    let provider = StaticIndex::default()
        .with_wheel("pandas", "1.5.2", &[
            "python-dateutil (>=2.8.1)",
            "pytz (>=2020.1)",
            "numpy (>=1.21.0)",
        ])
        .with_wheel("pandas", "1.5.1", &[
            "python-dateutil (>=2.8.1)",
            "pytz (>=2020.1)",
            "numpy (>=1.21.0)",
        ])
        .with_wheel("numpy", "1.24.1", &[])
        .with_wheel("numpy", "1.23.5", &[])
        .with_wheel("python-dateutil", "2.8.2", &["six (>=1.5)"])
        .with_wheel("pytz", "2022.7", &[])
        .with_wheel("six", "1.16.0", &[])
        .provider();

    let options = ResolveOptions {
        download_wheels: false,
        ..ResolveOptions::default()
    };
    let resolution = resolve_with(provider, &["pandas"], &options).await.unwrap();

    assert_eq!(
        pins(&resolution),
        expected(&[
            ("numpy", "1.24.1"),
            ("pandas", "1.5.2"),
            ("python-dateutil", "2.8.2"),
            ("pytz", "2022.7"),
            ("six", "1.16.0"),
        ])
    );
}

/// The matplotlib 3.6.2 dependency tree with the wheel metadata path and a synchronous executor.
#[tokio::test]
async fn test_matplotlib() {
    let provider = StaticIndex::default()
        .with_wheel("matplotlib", "3.6.2", &[
            "contourpy (>=1.0.1)",
            "cycler (>=0.10)",
            "fonttools (>=4.22.0)",
            "kiwisolver (>=1.0.1)",
            "numpy (>=1.19)",
            "packaging (>=20.0)",
            "pillow (>=6.2.0)",
            "pyparsing (>=2.2.1)",
            "python-dateutil (>=2.7)",
        ])
        .with_wheel("contourpy", "1.0.6", &["numpy (>=1.16)"])
        .with_wheel("cycler", "0.11.0", &[])
        .with_wheel("fonttools", "4.38.0", &[])
        .with_wheel("kiwisolver", "1.4.4", &[])
        .with_wheel("numpy", "1.24.1", &[])
        .with_wheel("packaging", "23.0", &[])
        .with_wheel("Pillow", "9.4.0", &[])
        .with_wheel("pyparsing", "3.0.9", &[])
        .with_wheel("python-dateutil", "2.8.2", &["six (>=1.5)"])
        .with_wheel("six", "1.16.0", &[])
        .provider();

    let options = ResolveOptions {
        download_wheels: true,
        executor: BuildExecutor::Synchronous,
        ..ResolveOptions::default()
    };
    let resolution = resolve_with(provider, &["matplotlib"], &options)
        .await
        .unwrap();

    assert_eq!(
        pins(&resolution),
        expected(&[
            ("contourpy", "1.0.6"),
            ("cycler", "0.11.0"),
            ("fonttools", "4.38.0"),
            ("kiwisolver", "1.4.4"),
            ("matplotlib", "3.6.2"),
            ("numpy", "1.24.1"),
            ("packaging", "23.0"),
            ("pillow", "9.4.0"),
            ("pyparsing", "3.0.9"),
            ("python-dateutil", "2.8.2"),
            ("six", "1.16.0"),
        ])
    );
}

/// Two resolutions of the same inputs yield the identical ordered list.
#[tokio::test]
async fn test_determinism() {
    let build = || {
        StaticIndex::default()
            .with_wheel("app", "2.0", &["lib-a", "lib-b"])
            .with_wheel("lib-a", "1.1", &["shared (<2)"])
            .with_wheel("lib-a", "1.0", &["shared (<2)"])
            .with_wheel("lib-b", "3.2", &["shared (>=1)"])
            .with_wheel("shared", "1.5", &[])
            .with_wheel("shared", "2.1", &[])
            .provider()
    };

    let options = ResolveOptions::default();
    let first = resolve_with(build(), &["app"], &options).await.unwrap();
    let second = resolve_with(build(), &["app"], &options).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(
        pins(&first),
        expected(&[
            ("app", "2.0"),
            ("lib-a", "1.1"),
            ("lib-b", "3.2"),
            ("shared", "1.5"),
        ])
    );
}

/// A conflict on an already pinned package pops the most recent pin and retries a lower version.
#[tokio::test]
async fn test_backtracking() {
    let provider = StaticIndex::default()
        .with_wheel("a", "1.0", &["c (<2)"])
        .with_wheel("b", "2.0", &["c (>=2)"])
        .with_wheel("b", "1.0", &["c (<2)"])
        .with_wheel("c", "2.0", &[])
        .with_wheel("c", "1.0", &[])
        .provider();

    let resolution = resolve_with(provider, &["a==1.0", "b"], &ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(
        pins(&resolution),
        expected(&[("a", "1.0"), ("b", "1.0"), ("c", "1.0")])
    );
}

/// The unsatisfiable explanation names the contested package and both contributors.
#[tokio::test]
async fn test_unsatisfiable() {
    let provider = StaticIndex::default()
        .with_wheel("pkga", "1.0", &["pkgc (<2)"])
        .with_wheel("pkgb", "1.0", &["pkgc (>=2)"])
        .with_wheel("pkgc", "1.0", &[])
        .with_wheel("pkgc", "2.0", &[])
        .provider();

    let err = resolve_with(
        provider,
        &["pkga==1.0", "pkgb==1.0"],
        &ResolveOptions::default(),
    )
    .await
    .unwrap_err();

    let ResolveError::Unsatisfiable(report) = &err else {
        panic!("expected an unsatisfiable error, got {err}");
    };
    let message = report.to_string();
    assert!(message.contains("pkgc"), "missing package: {message}");
    assert!(message.contains("pkga 1.0"), "missing contributor: {message}");
    assert!(message.contains("pkgb 1.0"), "missing contributor: {message}");
}

/// A root requirement for a package the index does not know is fatal and names the contributor.
#[tokio::test]
async fn test_no_such_package() {
    let provider = StaticIndex::default()
        .with_wheel("real", "1.0", &[])
        .provider();

    let err = resolve_with(provider, &["ghost"], &ResolveOptions::default())
        .await
        .unwrap_err();

    let ResolveError::Unsatisfiable(report) = &err else {
        panic!("expected an unsatisfiable error, got {err}");
    };
    assert!(report.to_string().contains("ghost"));
}

/// An sdist-only package is built exactly once; a second resolution in the same process hits the
/// cache and builds nothing.
#[tokio::test]
async fn test_sdist_built_once() {
    let provider = StaticIndex::default()
        .with_wheel("app", "1.0", &["native-dep"])
        .with_sdist("native-dep", "0.5.1", &[])
        .provider();

    let resolution = resolve_with(provider.clone(), &["app"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(
        pins(&resolution),
        expected(&[("app", "1.0"), ("native-dep", "0.5.1")])
    );
    assert_eq!(provider.builds_of("native-dep", "0.5.1"), 1);

    let second = resolve_with(provider.clone(), &["app"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(pins(&second), pins(&resolution));
    assert_eq!(provider.builds_of("native-dep", "0.5.1"), 1);
}

/// An empty requirement set resolves to the empty list.
#[tokio::test]
async fn test_empty_requirements() {
    let provider = StaticIndex::default().provider();
    let resolution = resolve_with(provider, &[], &ResolveOptions::default())
        .await
        .unwrap();
    assert!(resolution.packages.is_empty());
}

/// A requirement whose marker is false contributes nothing and does not pull in the package.
/// The index does not even know the package, so touching it would fail the resolution.
#[tokio::test]
async fn test_false_marker_is_ignored() {
    let provider = StaticIndex::default()
        .with_wheel("portable", "1.0", &["pywin32 ; sys_platform == 'win32'"])
        .provider();

    let resolution = resolve_with(provider, &["portable"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(pins(&resolution), expected(&[("portable", "1.0")]));
}

/// Pre-release versions are not selected unless they are the only option or explicitly admitted.
#[tokio::test]
async fn test_prerelease_selection() {
    let build = || {
        StaticIndex::default()
            .with_wheel("lib", "1.0", &[])
            .with_wheel("lib", "2.0b1", &[])
            .provider()
    };

    let resolution = resolve_with(build(), &["lib"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(pins(&resolution), expected(&[("lib", "1.0")]));

    // An exact pre-release specifier admits the pre-release.
    let resolution = resolve_with(build(), &["lib==2.0b1"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(pins(&resolution), expected(&[("lib", "2.0b1")]));

    // And so does the global opt-in.
    let options = ResolveOptions {
        pre_release_resolution: PreReleaseResolution::Allow,
        ..ResolveOptions::default()
    };
    let resolution = resolve_with(build(), &["lib"], &options).await.unwrap();
    assert_eq!(pins(&resolution), expected(&[("lib", "2.0b1")]));
}

/// Extras pull in the gated requirement group and are reported on the pinned package.
#[tokio::test]
async fn test_extras() {
    let provider = StaticIndex::default()
        .with_wheel_full(
            "coffee",
            "1.0",
            &["water", "mug ; extra == 'cup'"],
            &["cup"],
            None,
        )
        .with_wheel("water", "1.2", &[])
        .with_wheel("mug", "0.3", &[])
        .provider();

    let resolution = resolve_with(provider, &["coffee[cup]"], &ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(
        pins(&resolution),
        expected(&[("coffee", "1.0"), ("mug", "0.3"), ("water", "1.2")])
    );
    let coffee = &resolution.packages[0];
    assert_eq!(coffee.name.as_str(), "coffee");
    assert_eq!(coffee.extras.len(), 1);
    assert_eq!(coffee.extras[0].as_str(), "cup");
}

/// A version whose metadata excludes the target interpreter is forbidden and the next one tried.
#[tokio::test]
async fn test_requires_python_rejection() {
    let provider = StaticIndex::default()
        .with_wheel_full("modern", "2.0", &[], &[], Some(">=3.11"))
        .with_wheel_full("modern", "1.0", &[], &[], Some(">=3.8"))
        .provider();

    let resolution = resolve_with(provider, &["modern"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(pins(&resolution), expected(&[("modern", "1.0")]));
}

/// Dependency cycles resolve naturally because state is keyed by name, not by a tree.
#[tokio::test]
async fn test_cyclic_dependencies() {
    let provider = StaticIndex::default()
        .with_wheel("ouroboros", "1.0", &["tail"])
        .with_wheel("tail", "1.0", &["ouroboros"])
        .provider();

    let resolution = resolve_with(provider, &["ouroboros"], &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(
        pins(&resolution),
        expected(&[("ouroboros", "1.0"), ("tail", "1.0")])
    );
}

/// Disabling the speculative prefetcher does not change the outcome.
#[tokio::test]
async fn test_prefetch_is_transparent() {
    let build = || {
        StaticIndex::default()
            .with_wheel("app", "2.0", &["lib-a", "lib-b"])
            .with_wheel("lib-a", "1.1", &["shared (<2)"])
            .with_wheel("lib-b", "3.2", &["shared (>=1)"])
            .with_wheel("shared", "1.5", &[])
            .with_wheel("shared", "2.1", &[])
            .provider()
    };

    let with_prefetch = resolve_with(build(), &["app"], &ResolveOptions::default())
        .await
        .unwrap();
    let without_prefetch = resolve_with(
        build(),
        &["app"],
        &ResolveOptions {
            speculative_prefetch: false,
            ..ResolveOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(with_prefetch, without_prefetch);
}

/// Extras demanded late, after the package was already pinned, still pull in the gated group.
#[tokio::test]
async fn test_late_extra_on_pinned_package() {
    // The name-based tie-break makes the resolver pin "mm-shared" (without extras, so "bonus" is
    // not pulled in yet) before it ever looks at "zz-later", which then demands mm-shared[extra].
    let provider = StaticIndex::default()
        .with_wheel("app", "1.0", &["aa-early", "zz-later"])
        .with_wheel("aa-early", "1.0", &["mm-shared"])
        .with_wheel("zz-later", "1.0", &["mm-shared[extra]"])
        .with_wheel_full(
            "mm-shared",
            "1.0",
            &["bonus ; extra == 'extra'"],
            &["extra"],
            None,
        )
        .with_wheel("bonus", "1.0", &[])
        .provider();

    let resolution = resolve_with(provider, &["app"], &ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(
        pins(&resolution),
        expected(&[
            ("aa-early", "1.0"),
            ("app", "1.0"),
            ("bonus", "1.0"),
            ("mm-shared", "1.0"),
            ("zz-later", "1.0"),
        ])
    );
}
