use anyhow::{Context as _, Result as AnyhowResult};
use btrfs_backup::backup_error::BackupError;
use btrfs_backup::cli;
use btrfs_backup::coordinator::{CancellationToken, Coordinator, RunOptions};
use btrfs_backup::endpoint::SourceEndpoint;
use btrfs_backup::journal::LockJournal;
use log::{info, warn};

fn main() -> AnyhowResult<()> {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = err
                .downcast_ref::<BackupError>()
                .map(BackupError::exit_code)
                .unwrap_or(2);
            eprintln!("Error: {err:#}");
            std::process::exit(code);
        }
    }
}

/// Parses arguments and runs one replication pass. Kept as a single
/// fallible function (rather than splitting argument parsing into `main`)
/// so a bad flag or an unreadable `@file` goes through the same
/// `BackupError::exit_code` mapping as every other failure mode.
fn run() -> AnyhowResult<i32> {
    let args = cli::parse().context("failed to parse command line arguments")?;

    env_logger::Builder::new()
        .filter_level(args.log_level_filter())
        .parse_default_env()
        .init();

    let source = SourceEndpoint::new(
        &args.source,
        args.source.join(&args.snapshot_folder),
        &args.snapshot_prefix,
    );

    let destination_opts = cli::DestinationOptions {
        prefix: args.snapshot_prefix.clone(),
        create_if_missing: args.create_dest_dir,
        identity_file: args.identity_file.clone(),
    };

    let explicit_destinations = args
        .destinations
        .iter()
        .map(|spec| cli::parse_destination(spec, &destination_opts))
        .collect::<Result<Vec<_>, BackupError>>()
        .context("invalid destination")?;

    let destinations = if args.locked_dests {
        let journal = LockJournal::load(source.journal_path())?;
        cli::expand_locked_destinations(explicit_destinations, &journal, &destination_opts)
    } else {
        explicit_destinations
    };

    let options = RunOptions {
        create_snapshot: !args.no_snapshot,
        do_transfer: !args.no_transfer,
        retain_source_count: args.num_snapshots,
        retain_destination_count: args.num_backups,
        remove_locks: args.remove_locks,
        show_progress: args.progress,
    };

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone())?;

    let mut coordinator = Coordinator::new(source, destinations, options, cancel);
    let report = coordinator.run()?;

    if report.terminated_early {
        warn!("run terminated early");
    }
    info!(
        "run complete: {} transferred, {} failed, {} deleted at source, {} deleted at destinations",
        report.transferred.len(),
        report.failed_transfers.len(),
        report.deleted_source.len(),
        report.deleted_destination.len()
    );

    Ok(if report.had_failures() { 1 } else { 0 })
}

/// Installs a process-wide `SIGINT`/`SIGTERM` handler once at startup that
/// sets the cooperative cancellation flag the coordinator polls between
/// transfers and kills any pipeline child still running. The
/// `ctrlc::set_handler` usage follows `HimbeerserverDE-hbak/hbakd`'s own
/// server loop.
fn install_signal_handler(cancel: CancellationToken) -> AnyhowResult<()> {
    ctrlc::set_handler(move || {
        warn!("received termination signal; finishing the in-flight transfer and exiting");
        cancel.cancel();
    })
    .context("failed to install signal handler")?;

    Ok(())
}
