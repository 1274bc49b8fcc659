use anyhow::{Context, Result};
use clap::Parser;
use fuser::{Config, MountOption};
use sentinel_core::backup::DEFAULT_SIZE_CAP;
use sentinel_fs::gate::{SentinelFs, ENTROPY_THRESHOLD};
use sentinel_fs::transport::SentinelMount;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Entropy-gated pass-through filesystem with just-in-time backups",
    long_about = None
)]
struct Cli {
    /// Directory whose contents are exposed (and guarded) through the mount
    storage_path: PathBuf,

    /// Mount point for the guarded view
    mount_point: PathBuf,

    /// Additional mount options forwarded to the FUSE transport
    /// (e.g. -o allow_other -o auto_unmount)
    #[arg(short = 'o', long = "option", value_name = "OPTION")]
    options: Vec<String>,
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage_root = cli
        .storage_path
        .canonicalize()
        .with_context(|| format!("invalid storage path {}", cli.storage_path.display()))?;

    // Classifier handle, backup directory, and counters all come up here;
    // a failure aborts before anything is mounted.
    let fs = Arc::new(SentinelFs::new(storage_root)?);

    info!(
        storage = %fs.storage_root().display(),
        mount = %cli.mount_point.display(),
        backups = %fs.backup_root().display(),
        entropy_threshold = ENTROPY_THRESHOLD,
        backup_size_cap = DEFAULT_SIZE_CAP,
        "starting"
    );

    let mut options = vec![MountOption::FSName("sentinelfs".to_owned())];
    options.extend(cli.options.iter().map(|opt| parse_mount_option(opt)));

    let mut config = Config::default();
    config.mount_options = options;
    fuser::mount2(SentinelMount::new(fs), &cli.mount_point, &config)
        .context("filesystem transport failed")?;
    Ok(())
}

fn parse_mount_option(s: &str) -> MountOption {
    match s {
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
        x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
        x => MountOption::CUSTOM(x.into()),
    }
}
