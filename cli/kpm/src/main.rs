//! kpm CLI: resolve, vendor, inspect and publish KCL package dependencies.

mod commands;
mod context;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kpm_registry::{DepDownloader, Downloader};

use context::{Context, ResolveFlags};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "KPM_LOG";

#[derive(Parser)]
#[command(name = "kpm", version, about = "The KCL package manager")]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Accept checksum mismatches instead of failing
    #[arg(long, global = true)]
    no_sum_check: bool,
    /// Download into throwaway directories instead of the package cache
    #[arg(long, global = true)]
    no_cache: bool,
    /// Use vendored copies from vendor/ instead of the cache
    #[arg(long, global = true)]
    vendor: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve dependencies and update kcl.mod.lock
    Resolve,
    /// Copy every remote dependency into vendor/
    Vendor,
    /// Print the dependency graph as `parent child` lines
    Graph,
    /// Show the dependency tree
    Tree,
    /// Print each dependency's name and local path
    Deps,
    /// Add a dependency
    Add {
        /// Source: oci://..., git://..., a path, or name:version
        source: String,
        /// Dependency name (derived from the source if omitted)
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a dependency
    Remove {
        /// Dependency name
        name: String,
    },
    /// Download a package without resolving it
    Pull {
        /// Remote source: oci://..., git://..., registry://..., or name:version
        source: String,
        /// Target directory (default: derived from the source)
        dir: Option<PathBuf>,
    },
    /// Push the current package to an OCI registry
    Push {
        /// Target, e.g. oci://ghcr.io/org/pkg?tag=0.1.0 (default: the default registry)
        oci_ref: Option<String>,
        /// Validate without pushing
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the package cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached package
    Clean,
    /// Show where a source is cached
    Path {
        /// Remote source
        source: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli);
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let ctx = Context::load(ResolveFlags {
        no_cache: cli.no_cache,
        no_sum_check: cli.no_sum_check,
        vendor: cli.vendor,
    })?;
    let downloader = ctx.downloader()?;
    dispatch(cli.command, &cwd, &ctx, &downloader)
}

fn dispatch(
    command: Commands,
    cwd: &std::path::Path,
    ctx: &Context,
    downloader: &DepDownloader,
) -> anyhow::Result<()> {
    let dl: &dyn Downloader = downloader;

    // Push only talks to the registry; everything else may touch the cache.
    let _lock = match command {
        Commands::Push { .. } => None,
        _ => Some(ctx.lock_cache()?),
    };

    match command {
        Commands::Resolve => commands::resolve::resolve(&mut ctx.load_package(cwd)?, ctx, dl),
        Commands::Vendor => commands::vendor::run(&mut ctx.load_package(cwd)?, ctx, dl),
        Commands::Graph => commands::resolve::graph(&mut ctx.load_package(cwd)?, ctx, dl),
        Commands::Tree => commands::resolve::tree(&mut ctx.load_package(cwd)?, ctx, dl),
        Commands::Deps => commands::resolve::deps(&ctx.load_package(cwd)?, ctx, dl),
        Commands::Add { source, name } => {
            let mut pkg = ctx.load_package(cwd)?;
            commands::deps::add(&mut pkg, &source, name.as_deref(), ctx, dl)
        }
        Commands::Remove { name } => {
            let mut pkg = ctx.load_package(cwd)?;
            commands::deps::remove(&mut pkg, &name, ctx, dl)
        }
        Commands::Pull { source, dir } => {
            commands::pull::run(&source, dir.as_deref(), cwd, ctx, dl).map(|_| ())
        }
        Commands::Cache { action } => match action {
            CacheAction::Clean => commands::cache::clean(ctx),
            CacheAction::Path { source } => commands::cache::path(ctx, &source),
        },
        Commands::Push { oci_ref, dry_run } => {
            let pkg = ctx.load_package(cwd)?;
            commands::push::run(&pkg, oci_ref.as_deref(), dry_run, ctx, downloader.oci_client())
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use clap::CommandFactory;
    use kpm_core::{Package, MANIFEST_FILE};
    use kpm_registry::Settings;
    use std::path::Path;

    fn context(dir: &Path) -> Context {
        context_with(dir, ResolveFlags::default())
    }

    fn context_with(dir: &Path, flags: ResolveFlags) -> Context {
        let settings = Settings {
            cache_root: Some(dir.join("cache")),
            ..Settings::default()
        };
        Context::with_settings(settings, flags).unwrap()
    }

    fn write_pkg(dir: &Path, name: &str, deps: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!("[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n\n[dependencies]\n{deps}"),
        )
        .unwrap();
        std::fs::write(dir.join("main.k"), format!("{name} = 1\n")).unwrap();
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["kpm", "resolve", "--no-sum-check", "-v", "--vendor"]).unwrap();
        assert!(cli.no_sum_check);
        assert!(cli.vendor);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Resolve));
    }

    /// Full workflow: add -> resolve -> tree -> graph -> deps -> vendor -> remove.
    #[test]
    fn add_resolve_vendor_remove_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();
        let app = dir.path().join("app");
        write_pkg(&app, "app", "");
        write_pkg(&dir.path().join("lib"), "lib", "base = { path = \"../base\" }\n");
        write_pkg(&dir.path().join("base"), "base", "");

        // 1. Add a local dependency
        dispatch(
            Commands::Add {
                source: "../lib".to_string(),
                name: None,
            },
            &app,
            &ctx,
            &downloader,
        )
        .unwrap();
        let manifest = std::fs::read_to_string(app.join(MANIFEST_FILE)).unwrap();
        assert!(manifest.contains("lib"));
        let pkg = Package::load(&app).unwrap();
        assert!(pkg.locked.contains_key("lib"));
        assert!(pkg.locked.contains_key("base"));
        assert!(!pkg.dependencies.contains_key("base"));

        // 2. Read-only commands over the resolved set
        for command in [Commands::Resolve, Commands::Tree, Commands::Graph, Commands::Deps] {
            dispatch(command, &app, &ctx, &downloader).unwrap();
        }

        // 3. Vendor: local dependencies are not copied
        dispatch(Commands::Vendor, &app, &ctx, &downloader).unwrap();
        let vendor = app.join("vendor");
        assert!(vendor.is_dir());
        assert_eq!(std::fs::read_dir(&vendor).unwrap().count(), 0);

        // 4. Remove it again
        dispatch(
            Commands::Remove {
                name: "lib".to_string(),
            },
            &app,
            &ctx,
            &downloader,
        )
        .unwrap();
        let pkg = Package::load(&app).unwrap();
        assert!(pkg.dependencies.is_empty());
        assert!(pkg.locked.is_empty());
    }

    #[test]
    fn vendor_flag_resolves_from_vendor_directory() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        // Nothing listens on port 1: any download attempt fails.
        write_pkg(
            &app,
            "app",
            "k8s = { oci = \"oci://127.0.0.1:1/kcl-lang/k8s\", tag = \"1.28\" }\n",
        );
        write_pkg(&app.join("vendor").join("k8s_1.28.0"), "k8s", "");
        std::fs::write(
            app.join("vendor/k8s_1.28.0").join(MANIFEST_FILE),
            "[package]\nname = \"k8s\"\nversion = \"1.28.0\"\n",
        )
        .unwrap();

        let online = context(dir.path());
        let downloader = online.downloader().unwrap();
        assert!(dispatch(Commands::Resolve, &app, &online, &downloader).is_err());

        let vendored = context_with(
            dir.path(),
            ResolveFlags {
                vendor: true,
                ..ResolveFlags::default()
            },
        );
        dispatch(Commands::Resolve, &app, &vendored, &downloader).unwrap();
        let pkg = Package::load(&app).unwrap();
        assert_eq!(pkg.locked["k8s"].full_name, "k8s_1.28.0");
        dispatch(Commands::Deps, &app, &vendored, &downloader).unwrap();
    }

    #[test]
    fn commands_work_from_a_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();
        let app = dir.path().join("app");
        write_pkg(&app, "app", "");
        let nested = app.join("sub").join("dir");
        std::fs::create_dir_all(&nested).unwrap();

        dispatch(Commands::Resolve, &nested, &ctx, &downloader).unwrap();
        assert!(app.join(kpm_core::LOCK_FILE).is_file());
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();
        let err = dispatch(Commands::Tree, dir.path(), &ctx, &downloader).unwrap_err();
        assert!(err.to_string().contains(MANIFEST_FILE));
    }

    #[test]
    fn removing_unknown_dependency_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();
        let app = dir.path().join("app");
        write_pkg(&app, "app", "");

        let err = dispatch(
            Commands::Remove {
                name: "nope".to_string(),
            },
            &app,
            &ctx,
            &downloader,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn cache_commands() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();

        dispatch(
            Commands::Cache {
                action: CacheAction::Path {
                    source: "oci://ghcr.io/kcl-lang/helloworld?tag=0.1.2".to_string(),
                },
            },
            dir.path(),
            &ctx,
            &downloader,
        )
        .unwrap();
        dispatch(
            Commands::Cache {
                action: CacheAction::Clean,
            },
            dir.path(),
            &ctx,
            &downloader,
        )
        .unwrap();
        assert!(dir.path().join("cache").join(kpm_registry::lock::LOCK_FILE_NAME).is_file());
    }

    #[test]
    fn pull_rejects_local_sources() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let downloader = ctx.downloader().unwrap();
        let err = dispatch(
            Commands::Pull {
                source: "../somewhere".to_string(),
                dir: None,
            },
            dir.path(),
            &ctx,
            &downloader,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a remote source"));
    }
}
