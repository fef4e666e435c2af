//! ecfs-mount - batched staging of tape archive files
//!
//! Lists, stages and mounts ECFS archive paths. Files opened close together
//! are retrieved from tape in one batch into a local cache.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use ecfs_mount::config::{parse_delay, parse_octal, ArchiveScheme, StageConfig};
use ecfs_mount::ecfs::{EcfsError, EntryKind};
use ecfs_mount::fs::ArchiveCatalog;
use ecfs_mount::mount::MountManager;

/// CLI command
#[derive(Debug, PartialEq)]
enum Command {
    /// Mount an archive directory and wait for Ctrl+C
    Mount {
        archive_root: String,
        mountpoint: PathBuf,
    },
    /// List an archive path
    Ls {
        path: String,
        recursive: bool,
        json: bool,
    },
    /// Stage files and write them to stdout
    Cat { paths: Vec<String> },
    /// Stage files in one batch and print their cache paths
    Stage { paths: Vec<String> },
    /// Show help
    Help,
}

/// Global options layered over the environment
#[derive(Debug, Default, PartialEq)]
struct Options {
    cache: Option<PathBuf>,
    tmp: bool,
    override_existing: bool,
    no_touch: bool,
    delay: Option<Duration>,
    permissions: Option<u32>,
}

impl Options {
    fn apply(&self, config: &mut StageConfig) {
        if let Some(cache) = &self.cache {
            config.cache_root = cache.clone();
        }
        if self.tmp {
            config.scheme = ArchiveScheme::EcTmp;
        }
        if self.override_existing {
            config.policy.override_existing = true;
        }
        if self.no_touch {
            config.policy.touch = false;
        }
        if let Some(delay) = self.delay {
            config.policy.delay = delay;
        }
        if let Some(permissions) = self.permissions {
            config.policy.permissions = permissions;
        }
    }
}

fn print_help() {
    eprintln!(
        r#"ecfs-mount - Stage tape archive files through a local cache

USAGE:
    ecfs-mount [OPTIONS] mount <archive_path> <mountpoint>
    ecfs-mount [OPTIONS] ls [-R] [--json] <archive_path>
    ecfs-mount [OPTIONS] cat <archive_path>...
    ecfs-mount [OPTIONS] stage <archive_path>...
    ecfs-mount help

COMMANDS:
    mount   Mount an archive directory read-only (until Ctrl+C)
    ls      List an archive path (-R recursive, --json for JSON output)
    cat     Stage files and write them to stdout
    stage   Stage files in one batch and print their local paths
    help    Show this help message

OPTIONS:
    --cache <dir>          Local cache root (overrides EC_CACHE)
    --tmp                  Use the temporary archive area (ectmp:)
    --override             Re-stage files already in the cache
    --no-touch             Do not refresh mtimes of cached files
    --delay <secs>         Batching window before a retrieval starts
    --permissions <octal>  Permission bits of staged files

EXAMPLES:
    ecfs-mount stage /rdx/prepdata/a.grib /rdx/prepdata/b.grib
    ecfs-mount ls -R --json /rdx/prepdata
    ecfs-mount --tmp mount /scratch_run /mnt/ectmp

ENVIRONMENT:
    EC_CACHE             Local cache root (falls back to SCRATCH)
    EC_OVERRIDE          Re-stage cached files (true/false)
    EC_TOUCH             Refresh mtimes of cached files (true/false)
    EC_DELAY             Batching window in seconds (default 2)
    EC_FILE_PERMISSIONS  Octal permission bits of staged files (default 3777)
    EC_MAX_RETRIES       Retries of failed archive commands (default 0)
    ECFS_ELS, ECFS_ECP   Archive listing and copy tools
    RUST_LOG             Log level (trace, debug, info, warn, error)
"#
    );
}

fn option_value<'a>(args: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a String> {
    args.next()
        .ok_or_else(|| anyhow!("Option {} requires a value", flag))
}

fn parse_args(args: &[String]) -> Result<(Options, Command)> {
    let mut options = Options::default();
    let mut positional: Vec<String> = Vec::new();
    let mut recursive = false;
    let mut json = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cache" => options.cache = Some(PathBuf::from(option_value(&mut iter, arg)?)),
            "--tmp" => options.tmp = true,
            "--override" => options.override_existing = true,
            "--no-touch" => options.no_touch = true,
            "--delay" => options.delay = Some(parse_delay(option_value(&mut iter, arg)?)?),
            "--permissions" => {
                options.permissions = Some(parse_octal(option_value(&mut iter, arg)?)?)
            }
            "-R" | "--recursive" => recursive = true,
            "--json" => json = true,
            "help" | "--help" | "-h" if positional.is_empty() => {
                return Ok((options, Command::Help))
            }
            other if other.starts_with("--") => return Err(anyhow!("Unknown option: {}", other)),
            _ => positional.push(arg.clone()),
        }
    }

    let Some((command, rest)) = positional.split_first() else {
        return Ok((options, Command::Help));
    };

    let command = match command.as_str() {
        "mount" => match rest {
            [archive_root, mountpoint] => Command::Mount {
                archive_root: archive_root.clone(),
                mountpoint: PathBuf::from(mountpoint),
            },
            _ => return Err(anyhow!("Usage: ecfs-mount mount <archive_path> <mountpoint>")),
        },
        "ls" => match rest {
            [path] => Command::Ls {
                path: path.clone(),
                recursive,
                json,
            },
            [] => Command::Ls {
                path: "/".to_string(),
                recursive,
                json,
            },
            _ => return Err(anyhow!("Usage: ecfs-mount ls [-R] [--json] <archive_path>")),
        },
        "cat" if !rest.is_empty() => Command::Cat {
            paths: rest.to_vec(),
        },
        "stage" if !rest.is_empty() => Command::Stage {
            paths: rest.to_vec(),
        },
        "cat" | "stage" => return Err(anyhow!("Usage: ecfs-mount {} <archive_path>...", command)),
        other => {
            eprintln!("Unknown command: {}", other);
            Command::Help
        }
    };

    Ok((options, command))
}

/// Stage every path concurrently so the opens share one batch
async fn stage_paths(catalog: Arc<ArchiveCatalog>, paths: Vec<String>) -> Result<()> {
    let tasks: Vec<_> = paths
        .into_iter()
        .map(|path| {
            let catalog = Arc::clone(&catalog);
            tokio::task::spawn_blocking(move || {
                let mut handle = catalog.open(&path, "rb")?;
                let local = handle.local_path()?.to_path_buf();
                Ok::<_, EcfsError>((path, local))
            })
        })
        .collect();

    let mut failed = 0;
    for task in tasks {
        match task.await.context("Staging task panicked")? {
            Ok((path, local)) => println!("{} -> {}", path, local.display()),
            Err(e) => {
                error!(error = %e, "Failed to stage file");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} file(s) could not be staged", failed));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let args: Vec<String> = env::args().collect();
    let (options, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let mut config = StageConfig::from_env().context("Invalid staging configuration")?;
    options.apply(&mut config);
    info!(
        cache = %config.cache_root.display(),
        scheme = ?config.scheme,
        delay_ms = config.policy.delay.as_millis() as u64,
        "Using staging cache"
    );
    let catalog = Arc::new(ArchiveCatalog::from_config(config));

    match command {
        Command::Mount {
            archive_root,
            mountpoint,
        } => {
            let manager = MountManager::new();

            if let Err(e) = manager
                .mount(Arc::clone(&catalog), &archive_root, mountpoint.clone())
                .await
            {
                error!(error = %e, "Failed to mount archive");
                return Err(e);
            }

            info!(
                archive = %archive_root,
                mountpoint = %mountpoint.display(),
                "Archive mounted. Press Ctrl+C to unmount."
            );

            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, unmounting...");
            manager.unmount_all().await;
            catalog.listings().log_metrics();

            info!("Shutdown complete.");
        }
        Command::Ls {
            path,
            recursive,
            json,
        } => {
            let listing = {
                let catalog = Arc::clone(&catalog);
                tokio::task::spawn_blocking(move || catalog.ls(&path, true, recursive)).await??
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for info in listing {
                    let kind = match info.kind {
                        Some(EntryKind::Directory) => 'd',
                        Some(EntryKind::Symlink) => 'l',
                        _ => '-',
                    };
                    println!("{} {:>14} {}", kind, info.size.unwrap_or(0), info.name);
                }
            }
        }
        Command::Cat { paths } => {
            let catalog = Arc::clone(&catalog);
            tokio::task::spawn_blocking(move || -> Result<()> {
                // Open everything first so the first read stages the whole set
                let mut handles = paths
                    .iter()
                    .map(|p| catalog.open(p, "rb"))
                    .collect::<Result<Vec<_>, _>>()?;

                let stdout = io::stdout();
                let mut out = stdout.lock();
                for handle in &mut handles {
                    io::copy(&mut *handle, &mut out)
                        .with_context(|| format!("Failed to read {}", handle.remote_path()))?;
                }
                out.flush()?;
                Ok(())
            })
            .await??;
        }
        Command::Stage { paths } => {
            stage_paths(Arc::clone(&catalog), paths).await?;
        }
        Command::Help => print_help(),
    }

    Ok(())
}
