// src/main.rs

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pkgqueue::catalog::archive::probe_archive;
use pkgqueue::catalog::debian::{load_repository, load_status};
use pkgqueue::catalog::{Catalog, MemoryCatalog};
use pkgqueue::concurrent::mark_main_context;
use pkgqueue::download::{DownloadSnapshot, QueueObserver};
use pkgqueue::packages::Package;
use pkgqueue::solver::Conflict;
use pkgqueue::{AddOutcome, Config, DownloadManager, Queue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pkgqueue")]
#[command(author, version, about = "Plan, preflight and download apt package operations", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Package sources and requested operations shared by the planning commands
#[derive(clap::Args, Debug)]
struct Sources {
    /// Repository as URL=PACKAGES_FILE (may be repeated)
    #[arg(short, long = "repo", value_name = "URL=FILE")]
    repos: Vec<String>,

    /// dpkg status database
    #[arg(short, long, default_value = "/var/lib/dpkg/status")]
    status: PathBuf,

    /// Local .deb archive to queue for installation (may be repeated)
    #[arg(long = "deb", value_name = "PATH")]
    debs: Vec<PathBuf>,

    /// Package to install, as ID or ID=VERSION
    #[arg(short, long = "install", value_name = "PACKAGE")]
    installs: Vec<String>,

    /// Installed package to upgrade to the newest known version
    #[arg(short, long = "upgrade", value_name = "PACKAGE")]
    upgrades: Vec<String>,

    /// Installed package to remove
    #[arg(short = 'R', long = "remove", value_name = "PACKAGE")]
    removals: Vec<String>,

    /// Allow removing essential packages
    #[arg(long)]
    approve_essential: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue the requested operations and print the reconciled plan
    Plan {
        #[command(flatten)]
        sources: Sources,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Plan, then download and verify every archive the plan needs
    Download {
        #[command(flatten)]
        sources: Sources,
        /// Give up waiting for downloads after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stage the dependency closure of packages for the solver
    Preflight {
        #[command(flatten)]
        sources: Sources,
        /// Packages whose closure to stage
        packages: Vec<String>,
        /// Stage every installed package instead
        #[arg(long)]
        installed: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

/// Reports recheck failures on stderr
struct ConsoleObserver;

impl QueueObserver for ConsoleObserver {
    fn display_error(&self, message: &str) {
        eprintln!("Error: {}", message);
    }

    fn download_updated(&self, package_id: &str, download: &DownloadSnapshot) {
        debug!(
            "{}: {:.0}% ({} bytes)",
            package_id,
            download.progress * 100.0,
            download.total_bytes_written
        );
    }

    fn queue_ready(&self) {
        info!("All downloads verified, ready to install");
    }
}

#[derive(Serialize)]
struct PlanEntry {
    id: String,
    version: String,
}

#[derive(Serialize)]
struct PlanReport {
    queues: BTreeMap<&'static str, Vec<PlanEntry>>,
    conflicts: Vec<Conflict>,
}

#[derive(Serialize)]
struct DownloadReport {
    id: String,
    version: String,
    #[serde(flatten)]
    download: DownloadSnapshot,
}

/// Split `URL=FILE` at the last `=`
fn parse_repo_spec(spec: &str) -> Result<(&str, PathBuf)> {
    let (url, file) = spec
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("Repository must be given as URL=PACKAGES_FILE: {}", spec))?;
    if url.is_empty() || file.is_empty() {
        bail!("Repository must be given as URL=PACKAGES_FILE: {}", spec);
    }
    Ok((url, PathBuf::from(file)))
}

/// Split `ID=VERSION`
fn parse_package_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('=') {
        Some((id, version)) => (id, Some(version)),
        None => (spec, None),
    }
}

fn load_catalog(sources: &Sources) -> Result<Arc<MemoryCatalog>> {
    let catalog = Arc::new(MemoryCatalog::new());

    for spec in &sources.repos {
        let (url, file) = parse_repo_spec(spec)?;
        let name = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        let repo = load_repository(&name, url, &file)
            .with_context(|| format!("Failed to load repository {}", url))?;
        catalog.add_repository(repo);
    }

    if sources.status.exists() {
        let installed = load_status(&sources.status)
            .with_context(|| format!("Failed to read {}", sources.status.display()))?;
        info!("{} installed packages", installed.len());
        catalog.set_installed(installed);
    } else {
        warn!("Status database {} not found", sources.status.display());
    }

    Ok(catalog)
}

fn build_manager(config: Config, catalog: Arc<MemoryCatalog>) -> Result<DownloadManager> {
    let manager = DownloadManager::builder(config)
        .catalog(catalog)
        .observer(Arc::new(ConsoleObserver))
        .start_downloads_on_reload(false)
        .build()?;
    Ok(manager)
}

fn report_outcome(id: &str, queue: Queue, outcome: AddOutcome) -> Result<()> {
    match outcome {
        AddOutcome::Added | AddOutcome::AlreadyQueued => {
            debug!("{} -> {}", id, queue);
            Ok(())
        }
        AddOutcome::NeedsApproval => {
            bail!("{} is essential; pass --approve-essential to remove it", id)
        }
        AddOutcome::Locked => bail!("Queue is locked for installation"),
    }
}

/// Queue every requested operation
fn queue_requests(
    manager: &DownloadManager,
    catalog: &MemoryCatalog,
    sources: &Sources,
) -> Result<()> {
    for path in &sources.debs {
        let package =
            probe_archive(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let package = catalog.add_local(package);
        let id = package.id.clone();
        report_outcome(&id, Queue::Installations, manager.add(package, Queue::Installations, false))?;
    }

    for spec in &sources.installs {
        let (id, version) = parse_package_spec(spec);
        let newest = catalog
            .local_package(id)
            .or_else(|| catalog.package_by_identifier(id, None))
            .ok_or_else(|| anyhow!("Package {} not found in any repository", id))?;
        let package = match version {
            Some(version) => newest
                .version_of(version)
                .ok_or_else(|| anyhow!("Version {} of {} not found", version, id))?,
            None => newest,
        };
        report_outcome(id, Queue::Installations, manager.add(package, Queue::Installations, false))?;
    }

    for id in &sources.upgrades {
        if catalog.installed_package(id).is_none() {
            bail!("{} is not installed", id);
        }
        let package = catalog
            .package_by_identifier(id, None)
            .ok_or_else(|| anyhow!("No upgrade for {} in any repository", id))?;
        report_outcome(id, Queue::Upgrades, manager.add(package, Queue::Upgrades, false))?;
    }

    for id in &sources.removals {
        let package = catalog
            .installed_package(id)
            .ok_or_else(|| anyhow!("{} is not installed", id))?;
        let outcome = manager.add(package, Queue::Uninstallations, sources.approve_essential);
        report_outcome(id, Queue::Uninstallations, outcome)?;
    }

    Ok(())
}

fn plan_report(manager: &DownloadManager) -> PlanReport {
    let queues = Queue::ALL
        .iter()
        .map(|queue| {
            let entries = manager
                .members(*queue)
                .iter()
                .map(|package| PlanEntry {
                    id: package.id.clone(),
                    version: package.version.clone(),
                })
                .collect();
            (queue.as_str(), entries)
        })
        .collect();

    PlanReport {
        queues,
        conflicts: manager.conflicts(),
    }
}

fn print_plan(report: &PlanReport) {
    for (queue, entries) in &report.queues {
        if entries.is_empty() {
            continue;
        }
        println!("{}:", queue);
        for entry in entries {
            println!("  {} {}", entry.id, entry.version);
        }
    }
    if !report.conflicts.is_empty() {
        println!("Conflicts:");
        for conflict in &report.conflicts {
            println!("  {}: {}", conflict.package_id, conflict.relations.join(", "));
        }
    }
}

/// Load sources, queue requests and recheck
fn plan(config: Config, sources: &Sources) -> Result<DownloadManager> {
    let catalog = load_catalog(sources)?;
    let manager = build_manager(config, Arc::clone(&catalog))?;
    queue_requests(&manager, &catalog, sources)?;
    manager.reload_data_and_wait(true)?;
    info!("{} operations planned", manager.operation_count());
    Ok(manager)
}

fn cmd_plan(config: Config, sources: &Sources, json: bool) -> Result<()> {
    let manager = plan(config, sources)?;
    let report = plan_report(&manager);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_plan(&report);
        println!("\nTotal: {} operation(s)", manager.operation_count());
    }
    Ok(())
}

fn cmd_download(config: Config, sources: &Sources, timeout: u64, json: bool) -> Result<()> {
    let manager = plan(config, sources)?;
    if !manager.conflicts().is_empty() {
        print_plan(&plan_report(&manager));
        bail!("The plan has unresolved conflicts");
    }

    manager.start_more_downloads();
    if !manager.wait_until_settled(Duration::from_secs(timeout)) {
        manager.cancel_downloads();
        bail!("Downloads did not finish within {} seconds", timeout);
    }

    let mut reports = Vec::new();
    for queue in Queue::DOWNLOADS {
        for package in manager.members(queue) {
            let download = manager.queued_download(&package.id).unwrap_or_default();
            reports.push(DownloadReport {
                id: package.id.clone(),
                version: package.version.clone(),
                download,
            });
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            match (report.download.success, report.download.failure_reason.as_deref()) {
                (true, _) => println!("  {} {}: ok", report.id, report.version),
                (false, Some(reason)) => {
                    println!("  {} {}: failed ({})", report.id, report.version, reason)
                }
                (false, None) => println!("  {} {}: not downloaded", report.id, report.version),
            }
        }
        for path in manager.cached_download_files() {
            println!("Cached: {}", path.display());
        }
    }

    let failed = reports.iter().filter(|r| !r.download.success).count();
    if failed > 0 {
        bail!("{} of {} download(s) failed", failed, reports.len());
    }
    Ok(())
}

fn cmd_preflight(
    config: Config,
    sources: &Sources,
    packages: &[String],
    installed: bool,
) -> Result<()> {
    let catalog = load_catalog(sources)?;
    let manager = build_manager(config, Arc::clone(&catalog))?;

    let mut roots: Vec<Arc<Package>> = Vec::new();
    for id in packages {
        let package = catalog
            .package_by_identifier(id, None)
            .ok_or_else(|| anyhow!("Package {} not found in any repository", id))?;
        roots.push(package);
    }

    // Staging blocks on disk I/O, so it runs off the main context
    let preflight = Arc::clone(manager.preflight());
    let staged = std::thread::spawn(move || {
        if installed {
            preflight.preflight_installed()?;
        }
        preflight.stage(&roots)?;
        Ok::<_, pkgqueue::Error>(preflight.staging_files())
    })
    .join()
    .map_err(|_| anyhow!("Preflight worker panicked"))??;

    if staged.is_empty() {
        println!("Nothing staged.");
    } else {
        println!("Staging files:");
        for path in &staged {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    mark_main_context();
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "pkgqueue", &mut io::stdout());
        return Ok(());
    }

    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { sources, json } => cmd_plan(config, &sources, json),
        Commands::Download {
            sources,
            timeout,
            json,
        } => cmd_download(config, &sources, timeout, json),
        Commands::Preflight {
            sources,
            packages,
            installed,
        } => cmd_preflight(config, &sources, &packages, installed),
        Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_repo_spec() {
        let (url, file) = parse_repo_spec("https://repo.example.com/=/tmp/Packages").unwrap();
        assert_eq!(url, "https://repo.example.com/");
        assert_eq!(file, PathBuf::from("/tmp/Packages"));

        assert!(parse_repo_spec("https://repo.example.com/").is_err());
        assert!(parse_repo_spec("=/tmp/Packages").is_err());
    }

    #[test]
    fn test_parse_package_spec() {
        assert_eq!(parse_package_spec("bash"), ("bash", None));
        assert_eq!(parse_package_spec("bash=5.2-1"), ("bash", Some("5.2-1")));
    }

    #[test]
    fn test_plan_flags() {
        let cli = Cli::parse_from([
            "pkgqueue",
            "plan",
            "--repo",
            "https://repo.example.com/=/tmp/Packages",
            "-i",
            "curl",
            "-R",
            "wget",
            "--json",
        ]);
        let Commands::Plan { sources, json } = cli.command else {
            panic!("expected plan");
        };
        assert!(json);
        assert_eq!(sources.installs, vec!["curl"]);
        assert_eq!(sources.removals, vec!["wget"]);
        assert_eq!(sources.status, PathBuf::from("/var/lib/dpkg/status"));
    }
}
