use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use miette::{Context, IntoDiagnostic};
use serde::Serialize;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use pinwheel::index::PackageDb;
use pinwheel::python_env::{markers_from_env, markers_from_python, PythonLocation};
use pinwheel::tags::WheelTags;
use pinwheel::{
    normalize_index_url, resolve, BuildExecutor, PreReleaseResolution, PypiDependencyProvider,
    Requirement, ResolveOptions,
};

#[derive(Serialize, Debug)]
struct Solution {
    resolved: bool,
    packages: HashMap<String, String>,
    error: Option<String>,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[clap(num_args = 1.., required = true)]
    specs: Vec<Requirement>,

    /// Base URL of the Python Package Index (default <https://pypi.org/simple>). This should point
    /// to a repository compliant with PEP 691 (the json simple repository API).
    #[clap(default_value = "https://pypi.org/simple/", long)]
    index_url: Url,

    /// Verbose logging
    #[clap(short)]
    verbose: bool,

    /// Read dependencies from the per-release json documents of the index instead of from the
    /// wheels themselves.
    #[clap(long)]
    no_download_wheels: bool,

    /// Disable speculative metadata prefetching.
    #[clap(long)]
    no_prefetch: bool,

    /// Path to the python interpreter to use for resolving environment markers and running
    /// sdist build backends.
    #[clap(long, short)]
    python_interpreter: Option<PathBuf>,

    /// Maximum number of concurrent sdist builds.
    #[clap(long, default_value_t = 4)]
    build_concurrency: usize,

    /// Prefer pre-releases over normal releases
    #[clap(long)]
    pre: bool,

    #[clap(long)]
    json: bool,
}

async fn actual_main() -> miette::Result<()> {
    let args = Args::parse();

    // Setup tracing subscriber
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| get_default_env_filter(args.verbose)),
        )
        .init();

    // Determine cache directory
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| miette::miette!("failed to determine cache directory"))?
        .join("pinwheel");
    tracing::info!("cache directory: {}", cache_dir.display());

    // Construct a package database talking to the index
    let client = reqwest::Client::builder()
        .user_agent(concat!("pinwheel/", env!("CARGO_PKG_VERSION")))
        .build()
        .into_diagnostic()?;
    let package_db = PackageDb::new(
        client,
        &[normalize_index_url(args.index_url.clone())],
        &cache_dir,
    )
    .into_diagnostic()
    .wrap_err_with(|| {
        format!(
            "failed to construct package database for index {}",
            args.index_url
        )
    })?;

    // Determine the environment markers for the current machine
    let env_markers = match args.python_interpreter {
        Some(ref python) => markers_from_python(python).await.into_diagnostic()
            .wrap_err_with(|| {
                format!(
                    "failed to determine environment markers (could not run Python in path: {:?})",
                    python
                )
            })?,
        None => markers_from_env().await.into_diagnostic().wrap_err(
            "failed to determine environment markers for the current machine (could not run Python)",
        )?,
    };
    tracing::debug!(
        "extracted the following environment markers from the system python interpreter:\n{:#?}",
        env_markers
    );

    let compatible_tags = WheelTags::from_env_markers(&env_markers);
    tracing::debug!(
        "derived the following compatible wheel tags: {}",
        compatible_tags.tags().format(", ")
    );

    let python_location = match args.python_interpreter {
        Some(python_interpreter) => PythonLocation::Custom(python_interpreter),
        None => PythonLocation::System,
    };

    let pre_release_resolution = if args.pre {
        PreReleaseResolution::Allow
    } else {
        PreReleaseResolution::from_specs(&args.specs)
    };

    let resolve_opts = ResolveOptions {
        download_wheels: !args.no_download_wheels,
        pre_release_resolution,
        python_location,
        executor: BuildExecutor::Pool {
            limit: args.build_concurrency.max(1),
        },
        speculative_prefetch: !args.no_prefetch,
        ..ResolveOptions::default()
    };

    let provider = PypiDependencyProvider::new(
        Arc::new(package_db),
        Some(Arc::new(compatible_tags)),
        &resolve_opts,
    )
    .into_diagnostic()?;

    // Solve the requirements
    let resolution = match resolve(
        Arc::new(provider),
        &args.specs,
        &env_markers,
        &resolve_opts,
    )
    .await
    {
        Ok(resolution) => resolution,
        Err(err) => {
            return if args.json {
                let solution = Solution {
                    resolved: false,
                    packages: HashMap::default(),
                    error: Some(format!("{}", err)),
                };
                println!("{}", serde_json::to_string_pretty(&solution).unwrap());
                Ok(())
            } else {
                Err(miette::Report::new(err).wrap_err("Could not solve for requested requirements"))
            }
        }
    };

    if args.json {
        let solution = Solution {
            resolved: true,
            packages: resolution
                .packages
                .iter()
                .map(|p| (p.name.to_string(), p.version.to_string()))
                .collect(),
            error: None,
        };
        println!("{}", serde_json::to_string_pretty(&solution).unwrap());
        return Ok(());
    }

    // Output the selected versions
    println!("{}:", console::style("Resolved environment").bold());
    for spec in args.specs.iter() {
        println!("- {}", spec);
    }

    println!();
    let mut tabbed_stdout = tabwriter::TabWriter::new(std::io::stdout());
    writeln!(
        tabbed_stdout,
        "{}\t{}",
        console::style("Name").bold(),
        console::style("Version").bold()
    )
    .into_diagnostic()?;
    for pinned_package in resolution.packages.iter() {
        write!(tabbed_stdout, "{name}", name = pinned_package.name.as_str()).into_diagnostic()?;
        if !pinned_package.extras.is_empty() {
            write!(
                tabbed_stdout,
                "[{}]",
                pinned_package.extras.iter().map(|e| e.as_str()).join(",")
            )
            .into_diagnostic()?;
        }
        writeln!(
            tabbed_stdout,
            "\t{version}",
            version = pinned_package.version
        )
        .into_diagnostic()?;
    }
    tabbed_stdout.flush().into_diagnostic()?;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = actual_main().await {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

/// Constructs a default [`EnvFilter`] that is used when the user did not specify a custom RUST_LOG.
fn get_default_env_filter(verbose: bool) -> EnvFilter {
    let mut result = EnvFilter::new("pinwheel=info");

    if verbose {
        result = result.add_directive(Directive::from_str("pinwheel=debug").unwrap());
    }

    result
}
