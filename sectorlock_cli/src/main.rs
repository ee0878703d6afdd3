//! Sectorlock command line front-end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{self, LevelFilter};
use sectorlock::{
    logger_init, pf_error, pf_info, DiskLocation, FileIo, LeaseDaemon,
    LockspaceStatus, SectorlockError,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Parses a lease area location given as `PATH[:OFFSET]`.
fn parse_disk(s: &str) -> Result<DiskLocation, String> {
    let (path, offset) = match s.rsplit_once(':') {
        Some((path, offset)) => (
            path,
            offset
                .parse::<u64>()
                .map_err(|e| format!("bad offset '{}': {}", offset, e))?,
        ),
        None => (s, 0),
    };
    if path.is_empty() {
        return Err(format!("empty path in '{}'", s));
    }
    Ok(DiskLocation::new(PathBuf::from(path), offset))
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Daemon configuration as a TOML string.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes a fresh lockspace area.
    InitLockspace {
        #[arg(short, long)]
        name: String,
        /// Lease area as PATH[:OFFSET].
        #[arg(short, long, value_parser = parse_disk)]
        disk: DiskLocation,
        #[arg(long, default_value_t = 10)]
        io_timeout: u64,
        #[arg(long)]
        align: Option<u64>,
        #[arg(long)]
        sector: Option<u32>,
    },

    /// Prints the name and io_timeout of a lockspace area.
    ReadLockspace {
        #[arg(short, long, value_parser = parse_disk)]
        disk: DiskLocation,
        #[arg(long)]
        align: Option<u64>,
        #[arg(long)]
        sector: Option<u32>,
    },

    /// Writes a fresh resource area to every given replica.
    InitResource {
        #[arg(short, long)]
        lockspace: String,
        #[arg(short, long)]
        name: String,
        /// Replica as PATH[:OFFSET]; repeat for more.
        #[arg(short, long, value_parser = parse_disk, required = true)]
        disk: Vec<DiskLocation>,
        #[arg(long)]
        align: Option<u64>,
        #[arg(long)]
        sector: Option<u32>,
    },

    /// Prints the names and version of a resource area.
    ReadResource {
        #[arg(short, long, value_parser = parse_disk)]
        disk: DiskLocation,
        #[arg(long)]
        align: Option<u64>,
        #[arg(long)]
        sector: Option<u32>,
    },

    /// Prints the current owners of a resource.
    Owners {
        #[arg(short, long)]
        lockspace: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, value_parser = parse_disk, required = true)]
        disk: Vec<DiskLocation>,
    },

    /// Joins a lockspace and keeps renewing until interrupted.
    Join {
        #[arg(short, long)]
        lockspace: String,
        #[arg(short = 'i', long)]
        host_id: u64,
        #[arg(short, long, value_parser = parse_disk)]
        disk: DiskLocation,
        #[arg(long, default_value_t = 10)]
        io_timeout: u64,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SectorlockError)` on any error.
    fn sanitize(&self) -> Result<(), SectorlockError> {
        if self.threads < 2 {
            return Err(SectorlockError::invalid(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        match &self.command {
            Command::InitLockspace { io_timeout, .. }
            | Command::Join { io_timeout, .. }
                if *io_timeout == 0 =>
            {
                Err(SectorlockError::invalid("io_timeout must be positive"))
            }
            Command::Join { host_id, .. } if *host_id == 0 => {
                Err(SectorlockError::invalid("host_id must be at least 1"))
            }
            _ => Ok(()),
        }
    }
}

/// Runs one command against a fresh daemon.
async fn run_command(
    daemon: &LeaseDaemon,
    command: Command,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), SectorlockError> {
    match command {
        Command::InitLockspace {
            name,
            disk,
            io_timeout,
            align,
            sector,
        } => {
            daemon
                .write_lockspace(&name, &disk, io_timeout, align, sector)
                .await?;
            println!("lockspace '{}' written at {}", name, disk);
        }

        Command::ReadLockspace {
            disk,
            align,
            sector,
        } => {
            let info = daemon.read_lockspace(&disk, align, sector).await?;
            println!("{} io_timeout={}", info.space_name, info.io_timeout);
        }

        Command::InitResource {
            lockspace,
            name,
            disk,
            align,
            sector,
        } => {
            daemon
                .write_resource(&lockspace, &name, &disk, align, sector)
                .await?;
            println!(
                "resource '{}:{}' written to {} replica(s)",
                lockspace,
                name,
                disk.len()
            );
        }

        Command::ReadResource {
            disk,
            align,
            sector,
        } => {
            let info = daemon.read_resource(&disk, align, sector).await?;
            println!(
                "{}:{} version={}",
                info.space_name, info.resource_name, info.version
            );
        }

        Command::Owners {
            lockspace,
            name,
            disk,
        } => {
            let owners =
                daemon.read_resource_owners(&lockspace, &name, &disk).await?;
            if owners.is_empty() {
                println!("{}:{} is free", lockspace, name);
            }
            for owner in owners {
                println!(
                    "host_id={} generation={} timestamp={}",
                    owner.host_id, owner.generation, owner.timestamp
                );
            }
        }

        Command::Join {
            lockspace,
            host_id,
            disk,
            io_timeout,
        } => {
            daemon
                .add_lockspace(&lockspace, host_id, &disk, io_timeout, false)
                .await?;
            pf_info!("joined '{}' as host {}, Ctrl-C to leave", lockspace, host_id);

            loop {
                rx_term.changed().await?;
                if *rx_term.borrow() {
                    break;
                }
            }

            if daemon.inq_lockspace(&lockspace, host_id, &disk, true).await?
                == LockspaceStatus::Held
            {
                daemon.rem_lockspace(&lockspace, host_id, &disk, false).await?;
            } else {
                pf_error!("lockspace '{}' was lost while joined", lockspace);
            }
        }
    }
    Ok(())
}

/// Actual main function of the sectorlock CLI.
fn cli_main() -> Result<(), SectorlockError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| SectorlockError::msg(format!("ctrlc handler: {}", e)))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-sectorlock")
            .build()?;

        runtime.block_on(async move {
            let daemon = LeaseDaemon::new_and_setup(
                Arc::new(FileIo),
                args.config.as_deref(),
            )
            .await?;

            let result = run_command(&daemon, args.command, rx_term).await;
            daemon.shutdown().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            result
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the sectorlock CLI.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = cli_main() {
        pf_error!("cli_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn disk_locations() {
        assert_eq!(
            parse_disk("/dev/sdb:1048576"),
            Ok(DiskLocation::new("/dev/sdb", 1048576))
        );
        assert_eq!(parse_disk("/tmp/ls"), Ok(DiskLocation::new("/tmp/ls", 0)));
        assert!(parse_disk("/tmp/ls:abc").is_err());
        assert!(parse_disk(":512").is_err());
    }

    #[test]
    fn parse_subcommands() {
        let args = CliArgs::parse_from([
            "sectorlock_cli",
            "init-resource",
            "-l",
            "ls",
            "-n",
            "res",
            "-d",
            "/tmp/a:0",
            "-d",
            "/tmp/b:1048576",
        ]);
        match args.command {
            Command::InitResource { disk, .. } => assert_eq!(disk.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), SectorlockError> {
        let args = CliArgs::parse_from([
            "sectorlock_cli",
            "join",
            "-l",
            "ls",
            "-i",
            "3",
            "-d",
            "/tmp/ls",
        ]);
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs::parse_from([
            "sectorlock_cli",
            "--threads",
            "1",
            "read-lockspace",
            "-d",
            "/tmp/ls",
        ]);
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_host_id() {
        let args = CliArgs::parse_from([
            "sectorlock_cli",
            "join",
            "-l",
            "ls",
            "-i",
            "0",
            "-d",
            "/tmp/ls",
        ]);
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_io_timeout() {
        let args = CliArgs::parse_from([
            "sectorlock_cli",
            "init-lockspace",
            "-n",
            "ls",
            "-d",
            "/tmp/ls",
            "--io-timeout",
            "0",
        ]);
        assert!(args.sanitize().is_err());
    }
}
