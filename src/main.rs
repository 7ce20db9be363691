use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use arm::config::{ArmConfig, log_path};
use arm::ruleset::cancel::CancellationToken;
use arm::ruleset::downloader::{BatchSummary, ConcurrentDownloader, DownloadJob, DownloadResult};
use arm::ruleset::manager::RegistryManager;
use arm::ruleset::types::{ContentSelector, LATEST};

#[derive(Parser)]
#[command(name = "arm")]
#[command(version, about = "Resolve and install versioned rulesets from registries")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the versions a registry offers for a ruleset
    Versions { name: String },
    /// Resolve a version specifier to a concrete version
    Resolve { name: String, spec: String },
    /// Install rulesets given as `name@spec`
    Install {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Inspect the local cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// One JSON line per cached ruleset version
    List,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = arm::logging::init(Some(log_path().as_path()));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ArmConfig::load(path)?,
        None => ArmConfig::default(),
    };
    let manager = Arc::new(RegistryManager::from_config(&config));

    let result = match cli.command {
        Command::Versions { name } => {
            for version in manager.list_versions(&name).await? {
                println!("{}", version);
            }
            Ok(())
        }
        Command::Resolve { name, spec } => {
            println!("{}", manager.resolve_version(&name, &spec).await?);
            Ok(())
        }
        Command::Install {
            targets,
            dest,
            include,
            exclude,
        } => install(&manager, &targets, dest, include, exclude).await,
        Command::Cache {
            action: CacheAction::List,
        } => {
            for entry in manager.cache().list_entries()? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    };

    manager.close().await;
    result
}

async fn install(
    manager: &Arc<RegistryManager>,
    targets: &[String],
    dest: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let selector = ContentSelector::new(include).with_excludes(exclude);
    let (jobs, unplanned) = plan_jobs(manager, targets, &dest, &selector, &cancel);
    for result in &unplanned {
        report(result);
    }

    let downloader = ConcurrentDownloader::new(Arc::clone(manager));
    let mut results = downloader.download_all(jobs, report).await;
    results.extend(unplanned);

    let summary = BatchSummary::from_results(results);
    println!("{}", summary);
    summary.into_result()?;
    Ok(())
}

/// One job per target; targets whose registry can't be determined come back
/// as failed results
fn plan_jobs(
    manager: &RegistryManager,
    targets: &[String],
    dest: &Path,
    selector: &ContentSelector,
    cancel: &CancellationToken,
) -> (Vec<DownloadJob>, Vec<DownloadResult>) {
    let mut jobs = Vec::with_capacity(targets.len());
    let mut unplanned = Vec::new();
    for target in targets {
        let (name, spec) = parse_target(target);
        match manager.split_name(name) {
            Ok((registry, ruleset)) => jobs.push(
                DownloadJob::new(&registry, ruleset, spec, dest.join(ruleset))
                    .with_selector(selector.clone())
                    .with_cancel(cancel.clone()),
            ),
            Err(e) => {
                let job = DownloadJob::new("", name, spec, dest.join(name));
                unplanned.push(DownloadResult::failed(job, e.into()));
            }
        }
    }
    (jobs, unplanned)
}

fn report(result: &DownloadResult) {
    match &result.outcome {
        Ok(installed) => eprintln!(
            "installed {}/{}@{} ({} files)",
            installed.registry,
            installed.name,
            installed.resolved_version,
            installed.files.len()
        ),
        Err(e) => eprintln!("failed {}", e),
    }
}

/// `name@spec`, defaulting to `latest`
fn parse_target(target: &str) -> (&str, &str) {
    match target.split_once('@') {
        Some((name, spec)) if !spec.is_empty() => (name, spec),
        Some((name, _)) => (name, LATEST),
        None => (target, LATEST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm::config::ConcurrencyConfig;
    use arm::ruleset::cache::ContentCache;
    use arm::ruleset::error::{ConfigError, RegistryError};
    use rstest::rstest;
    use std::time::Duration;
    use tempfile::TempDir;

    #[rstest]
    #[case("python", ("python", "latest"))]
    #[case("python@^1.0", ("python", "^1.0"))]
    #[case("main/python@", ("main/python", "latest"))]
    #[case("main/python@feature/x", ("main/python", "feature/x"))]
    fn parse_target_splits_name_and_spec(#[case] target: &str, #[case] expected: (&str, &str)) {
        assert_eq!(parse_target(target), expected);
    }

    fn manager(temp_dir: &TempDir, default_registry: Option<&str>) -> RegistryManager {
        let cache = Arc::new(ContentCache::new(temp_dir.path(), Duration::from_secs(300)));
        let mut manager = RegistryManager::new(cache, ConcurrencyConfig::default());
        if let Some(name) = default_registry {
            manager.set_default_registry(name);
        }
        manager
    }

    #[test]
    fn unroutable_targets_fail_individually() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, None);
        let targets = vec!["python@^1.0".to_string(), "go".to_string()];

        let (jobs, unplanned) = plan_jobs(
            &manager,
            &targets,
            Path::new("out"),
            &ContentSelector::default(),
            &CancellationToken::new(),
        );

        assert!(jobs.is_empty());
        assert_eq!(unplanned.len(), 2);
        let Err(error) = &unplanned[0].outcome else {
            panic!("expected a failed result");
        };
        assert_eq!(error.ruleset, "python");
        assert_eq!(error.version, "^1.0");
        assert!(matches!(
            error.source,
            RegistryError::Config(ConfigError::NoDefaultRegistry(_))
        ));

        let summary = BatchSummary::from_results(unplanned);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.to_string().contains("go@latest"), "{summary}");
    }

    #[test]
    fn routable_targets_become_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, Some("main"));
        let targets = vec!["python@^1.0".to_string()];

        let (jobs, unplanned) = plan_jobs(
            &manager,
            &targets,
            Path::new("out"),
            &ContentSelector::new(["*.md"]),
            &CancellationToken::new(),
        );

        assert!(unplanned.is_empty());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].registry, "main");
        assert_eq!(jobs[0].ruleset, "python");
        assert_eq!(jobs[0].dest_dir, PathBuf::from("out/python"));
    }

    #[test]
    fn cli_parses_install_options() {
        let cli = Cli::parse_from([
            "arm", "install", "a@1.0.0", "b", "--dest", "out", "--include", "*.md", "--exclude",
            "draft/**",
        ]);

        let Command::Install {
            targets,
            dest,
            include,
            exclude,
        } = cli.command
        else {
            panic!("expected install");
        };
        assert_eq!(targets, vec!["a@1.0.0", "b"]);
        assert_eq!(dest, PathBuf::from("out"));
        assert_eq!(include, vec!["*.md"]);
        assert_eq!(exclude, vec!["draft/**"]);
    }
}
