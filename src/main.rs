use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use ntfs_compactor::compress::traversal::{compress_tree, TraversalOptions};
use ntfs_compactor::compress::{Compactor, CompressOutcome, CompressionAlgorithm};
use ntfs_compactor::config::{self, Settings, TomlStore, WatchEntry};
use ntfs_compactor::defrag::{self, DefragOutcome, Defragmenter};
use ntfs_compactor::format::file_length;
use ntfs_compactor::monitor::MonitorRegistry;
use ntfs_compactor::platform::NativeBackend;
use ntfs_compactor::signal::StopSignal;
use ntfs_compactor::volume;
use ntfs_compactor::watch::{WatchOptions, WatchScheduler};

/// Transparent NTFS compression and defragmentation for idle disks.
#[derive(Debug, Parser)]
#[command(name = "ntfs-compactor", version)]
struct Cli {
    /// Configuration file holding settings and watch entries.
    #[arg(long, env = "NTFS_COMPACTOR_CONFIG", default_value = "ntfs-compactor.toml")]
    config: PathBuf,

    /// Log per-file decisions.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compress a file or a directory tree.
    Compress {
        path: PathBuf,
        /// NONE, LZNT1, XPRESS4K, XPRESS8K, XPRESS16K or LZX.
        #[arg(short, long, default_value = "LZX")]
        algorithm: CompressionAlgorithm,
        /// Descend into subdirectories.
        #[arg(short, long)]
        recursive: bool,
        /// Keep compression only if clusters after / before is at most this.
        #[arg(long, default_value_t = 0.95)]
        min_ratio: f64,
    },
    /// Make files contiguous.
    Defrag {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Attempts per file when the free-space map goes stale.
        #[arg(long, default_value_t = 3)]
        retries: usize,
    },
    /// List the most fragmented files under a directory.
    Analyze {
        path: PathBuf,
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Sample a drive's utilization and report whether it counts as idle.
    Idle {
        /// Drive letter, e.g. `C`.
        drive: char,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Manage and run watched directories.
    Watch {
        #[command(subcommand)]
        command: WatchCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WatchCommand {
    /// Add a watched directory.
    Add {
        path: PathBuf,
        #[arg(short, long, default_value = "LZX")]
        algorithm: CompressionAlgorithm,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Stop watching a directory.
    Remove { path: PathBuf },
    /// Show the watched directories.
    List,
    /// Run the scheduler in the foreground until Ctrl-C.
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("ntfs_compactor={default_level}").parse()?),
        )
        .init();

    let settings = config::load_settings(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Command::Compress {
            path,
            algorithm,
            recursive,
            min_ratio,
        } => run_compress(&settings, &volume::normalize(&path), algorithm, recursive, min_ratio),
        Command::Defrag { files, retries } => {
            let files: Vec<PathBuf> = files.iter().map(|f| volume::normalize(f)).collect();
            run_defrag(&settings, &files, retries)
        }
        Command::Analyze { path, top } => run_analyze(&volume::normalize(&path), top),
        Command::Idle { drive, seconds } => run_idle(&settings, drive, seconds),
        Command::Watch { command } => run_watch(&cli.config, &settings, command),
    }
}

/// Stop signal raised by Ctrl-C.
fn interrupt_signal() -> Result<StopSignal> {
    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupted, finishing current item");
        handler_stop.stop();
    })
    .context("installing Ctrl-C handler")?;
    Ok(stop)
}

fn run_compress(
    settings: &Settings,
    path: &Path,
    algorithm: CompressionAlgorithm,
    recursive: bool,
    min_ratio: f64,
) -> Result<()> {
    let compactor = Compactor::new(NativeBackend::default(), settings.protected_root.clone());

    if !path.is_dir() {
        let outcome = compactor
            .apply_file(path, algorithm, min_ratio)
            .with_context(|| format!("compressing {}", path.display()))?;
        println!("{}: {}", path.display(), describe(&outcome));
        return Ok(());
    }

    let options = TraversalOptions {
        recursive,
        poll_interval: settings.poll_interval(),
        stop: Some(interrupt_signal()?),
        ..TraversalOptions::new(algorithm, min_ratio)
    };
    let progress = compress_tree(&compactor, path, &options, |progress| {
        if let Some(current) = &progress.current {
            println!(
                "[{:>5.1}%] {} / {}  {}",
                progress.fraction() * 100.0,
                file_length(progress.completed_bytes, 2),
                file_length(progress.total_bytes, 2),
                current.display()
            );
        }
        true
    })
    .with_context(|| format!("compressing {}", path.display()))?;

    println!(
        "{} files, {} processed, {} failed",
        progress.files_done,
        file_length(progress.completed_bytes, 2),
        progress.failures
    );
    Ok(())
}

fn describe(outcome: &CompressOutcome) -> String {
    match outcome {
        CompressOutcome::Skipped => "fits in one cluster, skipped".to_string(),
        CompressOutcome::Decompressed => "decompressed".to_string(),
        CompressOutcome::Applied { ratio } => format!("compressed to {:.0}%", ratio * 100.0),
        CompressOutcome::Rejected { ratio } => {
            format!("left uncompressed (would be {:.0}%)", ratio * 100.0)
        }
    }
}

fn run_defrag(settings: &Settings, files: &[PathBuf], retries: usize) -> Result<()> {
    let defragmenter = Defragmenter::new(NativeBackend::default(), settings.protected_root.clone());
    let mut failed = 0usize;

    for file in files {
        match defragmenter.defragment_with_retry(file, retries) {
            Ok(DefragOutcome::Relocated {
                extents,
                clusters,
                target_lcn,
            }) => println!(
                "{}: {} extents, {} clusters moved to lcn {}",
                file.display(),
                extents,
                clusters,
                target_lcn
            ),
            Ok(DefragOutcome::NotFragmented) => println!("{}: already contiguous", file.display()),
            Ok(DefragOutcome::NoContiguousSpace { clusters }) => println!(
                "{}: no free run of {} clusters",
                file.display(),
                clusters
            ),
            Err(e) => {
                failed += 1;
                tracing::error!("{}", e);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} files could not be defragmented", files.len());
    }
    Ok(())
}

fn run_analyze(path: &Path, top: usize) -> Result<()> {
    let backend = NativeBackend::default();
    let report = defrag::analyze_tree(&backend, path);
    if report.is_empty() {
        println!("No readable extent maps under {}", path.display());
        return Ok(());
    }

    println!("{:>8} {:>12} {:>8}  path", "extents", "clusters", "movable");
    for file in report.iter().take(top) {
        println!(
            "{:>8} {:>12} {:>8}  {}",
            file.extents,
            file.clusters,
            if file.movable { "yes" } else { "no" },
            file.path.display()
        );
    }
    let fragmented = report.iter().filter(|f| f.extents > 1).count();
    println!("{} of {} files fragmented", fragmented, report.len());
    Ok(())
}

fn run_idle(settings: &Settings, drive: char, seconds: u64) -> Result<()> {
    let registry = MonitorRegistry::native(
        settings.sample_period(),
        settings.sample_window,
        settings.counter_instances(),
    );
    let monitor = registry
        .get(drive)
        .with_context(|| format!("opening utilization counter for {drive}:"))?;

    std::thread::sleep(Duration::from_secs(seconds));

    let thresholds = settings.idle_thresholds();
    let samples: Vec<String> = monitor.samples().iter().map(|s| format!("{s:.1}")).collect();
    println!("{}: [{}]", monitor.key(), samples.join(", "));
    println!(
        "{} (avg < {:.0}%, max <= {:.0}%)",
        if monitor.is_idle(thresholds) { "idle" } else { "busy" },
        thresholds.avg,
        thresholds.max
    );
    registry.shutdown();
    Ok(())
}

fn run_watch(config_path: &Path, settings: &Settings, command: WatchCommand) -> Result<()> {
    let mut store = TomlStore::open(config_path)
        .with_context(|| format!("opening {}", config_path.display()))?;
    let mut entries = config::load_watch_entries(&store);

    match command {
        WatchCommand::Add {
            path,
            algorithm,
            recursive,
        } => {
            if !path.is_dir() {
                bail!("{} is not a directory", path.display());
            }
            let path = volume::normalize(&path);
            entries.retain(|e| !same_path(&e.path, &path));
            entries.push(WatchEntry {
                path,
                recursive,
                algorithm,
            });
            save(&mut store, &entries)
        }
        WatchCommand::Remove { path } => {
            let before = entries.len();
            entries.retain(|e| !same_path(&e.path, &path));
            if entries.len() == before {
                bail!("{} is not watched", path.display());
            }
            save(&mut store, &entries)
        }
        WatchCommand::List => {
            for (i, entry) in entries.iter().enumerate() {
                println!(
                    "{}. {} [{}{}]",
                    i + 1,
                    entry.path.display(),
                    entry.algorithm,
                    if entry.recursive { ", recursive" } else { "" }
                );
            }
            Ok(())
        }
        WatchCommand::Run => run_scheduler(settings, entries),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    volume::is_within(a, b) && volume::is_within(b, a)
}

fn save(store: &mut TomlStore, entries: &[WatchEntry]) -> Result<()> {
    config::save_watch_entries(store, entries);
    store
        .save()
        .with_context(|| format!("writing {}", store.path().display()))
}

fn run_scheduler(settings: &Settings, entries: Vec<WatchEntry>) -> Result<()> {
    if entries.is_empty() {
        tracing::warn!("No watched directories configured, nothing to do");
        return Ok(());
    }

    let monitors = Arc::new(MonitorRegistry::native(
        settings.sample_period(),
        settings.sample_window,
        settings.counter_instances(),
    ));
    let compactor = Compactor::new(NativeBackend::default(), settings.protected_root.clone());
    let mut scheduler =
        WatchScheduler::new(compactor, Arc::clone(&monitors), WatchOptions::from(settings));

    for entry in entries {
        let path = entry.path.clone();
        scheduler
            .watch(entry)
            .with_context(|| format!("watching {}", path.display()))?;
    }
    scheduler.start().context("starting reconciler")?;

    let stop = interrupt_signal()?;
    while !stop.wait(Duration::from_secs(3600)) {}

    scheduler.stop();
    monitors.shutdown();
    tracing::info!(pending = scheduler.pending().len(), "Scheduler stopped");
    Ok(())
}
