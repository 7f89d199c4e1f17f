use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use casket::config::{CasketConfig, Settings, CONFIG_ENV, CONFIG_FILE};
use casket::global::utils::get_global_config_dir;
use casket::verify::{verify_reader, Checksum};
use casket::{
    ArchiveApplier, ArtifactCache, CleanupReport, DirManifestLoader, Engine, FileRegistry,
    HostContext, HttpFetcher, LocalFilesystem, NativeApplier, Outcome, PackageStatus, PkgApplier,
};
use crate::cli::{CacheCommand, CasketCommand, CLI};

type CasketEngine =
    Engine<DirManifestLoader, HttpFetcher, NativeApplier, FileRegistry, LocalFilesystem>;

pub fn execute(cli: CLI) -> Result<()> {
    if let CasketCommand::Verify { file, checksum } = &cli.command {
        return execute_verify(file, checksum);
    }
    let settings = load_settings(cli.config)?;
    if let CasketCommand::Cache { command: CacheCommand::Clean } = &cli.command {
        ArtifactCache::new(&settings.cache_dir).clean()?;
        println!("Cache cleaned: {}", settings.cache_dir.display());
        return Ok(());
    }
    let engine = build_engine(&settings)?;
    match cli.command {
        CasketCommand::Install { identifier, force } => execute_install(&engine, &identifier, force),
        CasketCommand::Upgrade { identifier } => {
            let outcome = engine.upgrade(&identifier)?;
            print_outcome(&identifier, &outcome);
            Ok(())
        }
        CasketCommand::Uninstall { identifier, zap } => {
            let outcome = if zap {
                engine.zap(&identifier)?
            } else {
                engine.uninstall(&identifier)?
            };
            print_outcome(&identifier, &outcome);
            Ok(())
        }
        CasketCommand::Zap { identifier, dry_run } => execute_zap(&engine, &identifier, dry_run),
        CasketCommand::Status { identifier } => execute_status(&engine, &identifier),
        CasketCommand::Info { identifier } => execute_info(&engine, &identifier),
        CasketCommand::Versions { identifier } => {
            let versions = engine.versions(&identifier)?;
            if versions.is_empty() {
                println!("No versions found for {identifier}");
            }
            for version in versions {
                println!("{version}");
            }
            Ok(())
        }
        CasketCommand::List => execute_list(&engine),
        CasketCommand::Cache { command: CacheCommand::Prune { identifier } } => {
            let removed = engine.cleanup_cache(&identifier)?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            println!("{} cached artifact(s) removed", removed.len());
            Ok(())
        }
        CasketCommand::Verify { .. } | CasketCommand::Cache { command: CacheCommand::Clean } => Ok(()),
    }
}

fn config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(get_global_config_dir()?.join(CONFIG_FILE))
}

fn load_settings(flag: Option<PathBuf>) -> Result<Settings> {
    let path = config_path(flag)?;
    tracing::debug!(path = %path.display(), "loading config");
    CasketConfig::load_or_default(&path)?.resolve()
}

fn build_engine(settings: &Settings) -> Result<CasketEngine> {
    let fetcher = HttpFetcher::new(settings.fetch_timeout)?;
    let applier = NativeApplier::new(
        PkgApplier::new(&settings.install_target),
        ArchiveApplier::new(&settings.app_dir, &settings.receipts_dir),
    );
    let registry = FileRegistry::open(&settings.registry_dir)
        .with_context(|| format!("Could not open registry {}", settings.registry_dir.display()))?;
    let host = HostContext {
        arch: settings.arch.clone(),
        home_dir: settings.home_dir.clone(),
        app_dir: settings.app_dir.clone(),
    };
    let engine = Engine::new(
        DirManifestLoader::new(&settings.manifest_dir),
        fetcher,
        applier,
        registry,
        LocalFilesystem,
        host,
        &settings.lock_dir,
    )
    .with_cache(ArtifactCache::new(&settings.cache_dir));
    Ok(engine)
}

pub fn execute_install(engine: &CasketEngine, identifier: &str, force: bool) -> Result<()> {
    let outcome = if force {
        engine.install_or_upgrade(identifier)?
    } else {
        engine.install(identifier)?
    };
    print_outcome(identifier, &outcome);
    if matches!(outcome, Outcome::Installed { .. } | Outcome::Upgraded { .. }) {
        if let Some(caveats) = engine.manifest(identifier)?.caveats {
            println!();
            println!("{}", "==> Caveats".yellow().bold());
            println!("{}", caveats.trim_end());
        }
    }
    Ok(())
}

pub fn execute_zap(engine: &CasketEngine, identifier: &str, dry_run: bool) -> Result<()> {
    if dry_run {
        let targets = engine.plan_zap(identifier)?;
        if targets.is_empty() {
            println!("Nothing to delete");
        }
        for path in targets {
            println!("would delete {}", path.display());
        }
        return Ok(());
    }
    let outcome = engine.zap(identifier)?;
    print_outcome(identifier, &outcome);
    Ok(())
}

pub fn execute_status(engine: &CasketEngine, identifier: &str) -> Result<()> {
    match engine.status(identifier)? {
        PackageStatus::Absent => println!("{identifier}: {}", "not installed".dimmed()),
        PackageStatus::Installed { version } => {
            println!("{identifier}: {} {version}", "installed".green())
        }
        PackageStatus::Installing { from, target } => {
            let from = from.map(|v| format!(" from {v}")).unwrap_or_default();
            println!(
                "{identifier}: {} {target}{from} (interrupted; run `casket install {identifier}` to resume)",
                "installing".yellow()
            );
        }
    }
    Ok(())
}

pub fn execute_info(engine: &CasketEngine, identifier: &str) -> Result<()> {
    let manifest = engine.manifest(identifier)?;
    println!("{} {}", manifest.display_name.bold(), manifest.version);
    println!("{}", manifest.description);
    println!("{}", manifest.homepage);
    println!("identifier: {}", manifest.identifier);
    println!("architectures: {}", manifest.variant_tags());
    println!("registry id: {}", manifest.registry_id());
    match engine.status(identifier)? {
        PackageStatus::Installed { version } => println!("installed: {version}"),
        PackageStatus::Installing { target, .. } => println!("installing: {target} (interrupted)"),
        PackageStatus::Absent => println!("not installed"),
    }
    Ok(())
}

pub fn execute_list(engine: &CasketEngine) -> Result<()> {
    let records = engine.list()?;
    if records.is_empty() {
        println!("No packages installed");
        return Ok(());
    }
    for record in records {
        if record.is_installed() {
            println!("{}: {}", record.identifier, record.version);
        } else {
            println!("{}: {} ({})", record.identifier, record.version, "interrupted".yellow());
        }
    }
    Ok(())
}

pub fn execute_verify(file: &Path, checksum: &str) -> Result<()> {
    let expected = Checksum::try_from(checksum).map_err(|e| anyhow::anyhow!(e))?;
    let reader = std::fs::File::open(file).with_context(|| format!("Could not open {}", file.display()))?;
    let url = format!("file://{}", file.display());
    if let Err(e) = verify_reader(reader, &expected, &url) {
        bail!("{e}");
    }
    println!("{} {}", "OK".green(), file.display());
    Ok(())
}

fn print_outcome(identifier: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Installed { version } => {
            println!("{} {identifier} {version}", "Installed".green().bold())
        }
        Outcome::Upgraded { from, to } => {
            println!("{} {identifier} {from} -> {to}", "Upgraded".green().bold())
        }
        Outcome::AlreadyUpToDate { installed, .. } => {
            println!("{identifier} {installed} is already up to date")
        }
        Outcome::Uninstalled { version, report } => {
            println!("{} {identifier} {version}", "Uninstalled".green().bold());
            print_report(report);
        }
        Outcome::AlreadyAbsent => println!("{identifier} is not installed"),
        Outcome::Zapped { uninstalled, report } => {
            if let Some(version) = uninstalled {
                println!("{} {identifier} {version}", "Uninstalled".green().bold());
            }
            println!("{} {identifier}", "Zapped".green().bold());
            print_report(report);
        }
    }
}

fn print_report(report: &CleanupReport) {
    for path in &report.removed {
        println!("  removed {}", path.display());
    }
    for failure in &report.failures {
        eprintln!(
            "  {} {}: {}",
            "could not remove".red(),
            failure.path.display(),
            failure.reason
        );
    }
}
