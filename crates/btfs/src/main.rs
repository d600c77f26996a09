use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use fuser::MountOption;
use libbtfs::{
    EVENT_LOG_FILENAME, FsOps, LocalEngine, LocalEngineOptions, PieceWindowConfig, Session,
    SessionOptions, TorrentMeta, fuse::BtfsFilesystem, load_torrent_bytes,
    tracing_subscriber_config_utils::{InitLoggingOptions, init_logging},
};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use size_format::SizeFormatterBinary as SF;
use tracing::{info, warn};

mod stat;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The loglevel
    #[arg(value_enum, short = 'v', global = true)]
    log_level: Option<LogLevel>,

    /// Also write logs to this file.
    #[arg(long = "log-file", env = "BTFS_LOG_FILE", global = true)]
    log_file: Option<String>,

    /// The RUST_LOG value for the log file.
    #[arg(long = "log-file-rust-log", global = true)]
    log_file_rust_log: Option<String>,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Parser)]
struct MountOpts {
    /// Download metadata only, refuse to read file contents.
    #[arg(short, long = "browse-only")]
    browse_only: bool,

    /// Keep downloaded files after unmounting.
    #[arg(short, long)]
    keep: bool,

    /// Where per-mount working directories are created. Defaults to
    /// $HOME/btfs, or /tmp/btfs without a home directory.
    #[arg(long = "data-directory", env = "BTFS_DATA_DIRECTORY")]
    data_directory: Option<PathBuf>,

    /// Use this directory as the working directory instead of creating a new
    /// one. Pieces left there by an earlier mount with --keep are reused.
    #[arg(long = "working-directory", conflicts_with = "data_directory")]
    working_directory: Option<PathBuf>,

    /// Directory holding a copy of the torrent's content to fetch pieces from.
    #[arg(long)]
    source: PathBuf,

    /// How many pieces from the read position are downloaded first.
    #[arg(
        long = "urgent-pieces",
        default_value_t = 16,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    urgent_pieces: u32,

    /// Bytes past the end of each read to also queue for download.
    #[arg(long = "background-tail-bytes", default_value_t = 0)]
    background_tail_bytes: u64,

    /// Limit fetching to this many bytes per second.
    #[arg(long = "max-download-rate")]
    max_download_rate: Option<NonZeroU32>,

    /// Write every download engine event to a file in the working directory.
    #[arg(long = "event-log")]
    event_log: bool,

    /// Let other users access the mount.
    #[arg(long = "allow-other")]
    allow_other: bool,

    /// Path or http(s) URL of the .torrent file.
    metadata: String,

    mountpoint: PathBuf,
}

#[derive(Parser)]
struct StatOpts {
    #[arg(required = true)]
    mountpoints: Vec<PathBuf>,
}

#[derive(Parser)]
enum SubCommand {
    /// Mount a torrent.
    Mount(MountOpts),
    /// Show download progress of mounted torrents.
    Stat(StatOpts),
}

fn default_data_directory() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join("btfs"),
        _ => PathBuf::from("/tmp/btfs"),
    }
}

/// The per-mount working directory: `working_directory` as given, or a new
/// `btfs-XXXXXX` directory under the data directory.
fn prepare_working_directory(
    data_directory: Option<&Path>,
    working_directory: Option<&Path>,
) -> anyhow::Result<PathBuf> {
    if let Some(dir) = working_directory {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("error creating working directory {dir:?}"))?;
        return Ok(dir.to_owned());
    }
    let data_root = data_directory
        .map(|d| d.to_owned())
        .unwrap_or_else(default_data_directory);
    std::fs::create_dir_all(&data_root)
        .with_context(|| format!("error creating data directory {data_root:?}"))?;
    Ok(tempfile::Builder::new()
        .prefix("btfs-")
        .tempdir_in(&data_root)
        .with_context(|| format!("error creating working directory in {data_root:?}"))?
        .keep())
}

fn start_deadlock_detector_thread() {
    use parking_lot::deadlock;
    use std::thread;

    // Create a background thread which checks for deadlocks every 10s
    thread::spawn(move || {
        loop {
            thread::sleep(Duration::from_secs(10));
            let deadlocks = deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{i}");
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            std::process::exit(42);
        }
    });
}

/// Sends once on SIGINT or SIGTERM.
fn spawn_signal_listener() -> anyhow::Result<crossbeam_channel::Receiver<i32>> {
    let mut signals = Signals::new(TERM_SIGNALS).context("error registering signal handlers")?;
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let _ = tx.send(signal);
            }
        })
        .context("error spawning signal thread")?;
    Ok(rx)
}

fn mount(opts: MountOpts) -> anyhow::Result<()> {
    if !opts.mountpoint.is_dir() {
        bail!("mount point {:?} is not a directory", opts.mountpoint);
    }
    let signals = spawn_signal_listener()?;

    let torrent_bytes = load_torrent_bytes(&opts.metadata)?;
    let torrent = TorrentMeta::from_bytes(&torrent_bytes)
        .with_context(|| format!("error parsing torrent {:?}", opts.metadata))?;
    info!(
        name = %torrent.name,
        info_hash = %torrent.info_hash_hex(),
        files = torrent.files.len(),
        "loaded torrent, total size {}",
        SF::new(torrent.lengths.total_length())
    );

    let data_dir = prepare_working_directory(
        opts.data_directory.as_deref(),
        opts.working_directory.as_deref(),
    )?;
    info!(?data_dir, "using working directory");

    let engine = LocalEngine::new(
        &torrent,
        &opts.source,
        &data_dir.join("files"),
        LocalEngineOptions {
            max_download_rate: opts.max_download_rate,
        },
    )
    .context("error starting download engine");
    let engine = match engine {
        Ok(e) => e,
        Err(e) => {
            if !opts.keep {
                let _ = std::fs::remove_dir_all(&data_dir);
            }
            return Err(e);
        }
    };

    let session = Session::start(
        Arc::new(engine),
        SessionOptions {
            window: PieceWindowConfig {
                urgent_pieces: opts.urgent_pieces,
                background_tail_bytes: opts.background_tail_bytes,
            },
            browse_only: opts.browse_only,
            keep: opts.keep,
            data_dir: Some(data_dir.clone()),
            event_log: opts.event_log.then(|| data_dir.join(EVENT_LOG_FILENAME)),
            ..Default::default()
        },
    )
    .context("error starting session")?;

    let (unmounted_tx, unmounted_rx) = crossbeam_channel::bounded(1);
    let fs = BtfsFilesystem::new(FsOps::new(session.clone()), Some(unmounted_tx));

    let mut mount_options = vec![
        MountOption::RO,
        MountOption::FSName("btfs".to_owned()),
        MountOption::Subtype("btfs".to_owned()),
    ];
    if opts.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    let background = match fuser::spawn_mount2(fs, &opts.mountpoint, &mount_options) {
        Ok(b) => b,
        Err(e) => {
            if let Err(e) = session.shutdown() {
                warn!("error shutting down: {e:#}");
            }
            return Err(e).with_context(|| format!("error mounting at {:?}", opts.mountpoint));
        }
    };
    info!(mountpoint = ?opts.mountpoint, "mounted");

    crossbeam_channel::select! {
        recv(signals) -> signal => info!(?signal, "got signal, unmounting"),
        recv(unmounted_rx) -> _ => info!("unmounted"),
    }

    // Wake up blocked readers before the kernel waits on them.
    let res = session.shutdown();
    background.join();
    res.context("error shutting down")
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let default_rust_log = match opts.log_level.as_ref() {
        Some(level) => match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        },
        None => "info",
    };
    init_logging(InitLoggingOptions {
        default_rust_log_value: Some(default_rust_log),
        log_file: opts.log_file.as_deref(),
        log_file_rust_log: opts.log_file_rust_log.as_deref(),
    })?;

    if cfg!(debug_assertions) {
        start_deadlock_detector_thread();
    }

    match opts.subcommand {
        SubCommand::Mount(mount_opts) => mount(mount_opts),
        SubCommand::Stat(stat_opts) => stat::stat(&stat_opts.mountpoints),
    }
}
