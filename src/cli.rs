//! Command-line surface: flag parsing with `clap`'s derive API, `@file`
//! argument-file splicing, and destination-string parsing (`ssh://`,
//! `shell://`, else a local path).
//!
//! The `#[derive(Parser)]` style follows `hbak`/`hbakd`; `@file` splicing
//! has no precedent in either and is implemented by hand.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::warn;

use crate::backup_error::BackupError;
use crate::endpoint::{Destination, LocalEndpoint, ShellEndpoint, SshEndpoint};
use crate::journal::LockJournal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental btrfs snapshot replication", long_about = None)]
pub struct Cli {
    /// Source subvolume path.
    pub source: PathBuf,

    /// One or more destinations: an absolute path (local), `ssh://[user@]host[:port]/abs/path`,
    /// or `shell://<command>` (`%DEST%` is replaced with the new basename).
    pub destinations: Vec<String>,

    /// Prefix for snapshot basenames; disambiguates chains sharing a storage location.
    #[arg(short = 'p', long = "snapshot-prefix", default_value = "")]
    pub snapshot_prefix: String,

    /// Directory under the source subvolume where snapshots are created.
    #[arg(short = 'f', long = "snapshot-folder", default_value = "snapshot")]
    pub snapshot_folder: PathBuf,

    /// Source retention count. 0 or omitted = keep all.
    #[arg(short = 'N', long = "num-snapshots")]
    pub num_snapshots: Option<usize>,

    /// Per-destination retention count.
    #[arg(short = 'n', long = "num-backups")]
    pub num_backups: Option<usize>,

    /// Skip snapshot creation (still performs cleanup, transfer, retention).
    #[arg(long = "no-snapshot")]
    pub no_snapshot: bool,

    /// Skip planning and executing transfers.
    #[arg(long = "no-transfer")]
    pub no_transfer: bool,

    /// Expand the destination set to every destination named in the lock journal.
    #[arg(long = "locked-dests")]
    pub locked_dests: bool,

    /// Drop every matching lock entry for the given destinations without retransmitting.
    #[arg(long = "remove-locks")]
    pub remove_locks: bool,

    /// Create a destination directory (local or SSH) on first use instead of
    /// failing with `EndpointUnavailable`.
    #[arg(long = "create-dest-dir")]
    pub create_dest_dir: bool,

    /// Interpose `pv` between send and receive to show transfer progress.
    #[arg(long = "progress")]
    pub progress: bool,

    /// SSH identity file applied to every SSH destination invocation.
    #[arg(short = 'i', long = "identity-file")]
    pub identity_file: Option<String>,

    /// Suppress all log output.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Raise log verbosity one step per occurrence (info -> debug -> trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Map `-q`/`-v` onto a default `log::LevelFilter`, leaving `RUST_LOG`
    /// free to override it.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Off;
        }
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Parse the process' argument vector, splicing in `@file` contents first.
pub fn parse() -> Result<Cli, BackupError> {
    let raw: Vec<String> = std::env::args().collect();
    let mut expanded = vec![raw[0].clone()];
    expand_args(&raw[1..], &mut expanded, 0)?;
    Cli::try_parse_from(expanded).map_err(|err| BackupError::InvalidDestination(
        "command line".to_string(),
        err.to_string(),
    ))
}

const MAX_ARGFILE_DEPTH: u32 = 16;

/// Recursively splice the non-blank, non-`#`-prefixed lines of every
/// `@FILE` argument into `out`, stripping leading whitespace from each
/// line. Ordinary arguments pass through unchanged.
fn expand_args(args: &[String], out: &mut Vec<String>, depth: u32) -> Result<(), BackupError> {
    if depth > MAX_ARGFILE_DEPTH {
        return Err(BackupError::InvalidDestination(
            "@file".to_string(),
            "argument file nesting too deep (possible cycle)".to_string(),
        ));
    }

    for arg in args {
        match arg.strip_prefix('@') {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|err| {
                    BackupError::InvalidDestination(
                        format!("@{path}"),
                        format!("could not read argument file: {err}"),
                    )
                })?;

                let lines: Vec<String> = contents
                    .lines()
                    .map(str::trim_start)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string)
                    .collect();

                expand_args(&lines, out, depth + 1)?;
            }
            None => out.push(arg.clone()),
        }
    }

    Ok(())
}

/// Shared context for turning a destination string into an endpoint: the
/// active snapshot prefix plus the ambient flags that apply uniformly to
/// every SSH invocation for a given endpoint.
#[derive(Debug, Clone, Default)]
pub struct DestinationOptions {
    pub prefix: String,
    pub create_if_missing: bool,
    pub identity_file: Option<String>,
}

/// Parse a single destination string into a concrete endpoint.
pub fn parse_destination(spec: &str, opts: &DestinationOptions) -> Result<Destination, BackupError> {
    if let Some(rest) = spec.strip_prefix("ssh://") {
        return parse_ssh_destination(rest, opts).map(Destination::Ssh);
    }

    if let Some(command) = spec.strip_prefix("shell://") {
        return Ok(Destination::Shell(ShellEndpoint::new(command)));
    }

    let path = Path::new(spec);
    if !path.is_absolute() {
        return Err(BackupError::InvalidDestination(
            spec.to_string(),
            "local destinations must be an absolute path".to_string(),
        ));
    }

    Ok(Destination::Local(LocalEndpoint::new(
        path,
        &opts.prefix,
        opts.create_if_missing,
    )))
}

fn parse_ssh_destination(rest: &str, opts: &DestinationOptions) -> Result<SshEndpoint, BackupError> {
    let invalid = |detail: &str| {
        BackupError::InvalidDestination(format!("ssh://{rest}"), detail.to_string())
    };

    let (authority, path) = rest.split_once('/').ok_or_else(|| {
        invalid("missing absolute path component after the host")
    })?;
    let path = format!("/{path}");

    let (user_host, port) = match authority.rsplit_once(':') {
        Some((uh, port)) => (
            uh,
            Some(
                port.parse::<u16>()
                    .map_err(|_| invalid("port is not a valid number"))?,
            ),
        ),
        None => (authority, None),
    };

    let (user, host) = match user_host.split_once('@') {
        Some((user, host)) => (user.to_string(), host.to_string()),
        None => (crate::exec::current_user(), user_host.to_string()),
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(SshEndpoint::new(
        host,
        port,
        user,
        opts.identity_file.clone(),
        path,
        &opts.prefix,
        opts.create_if_missing,
    ))
}

/// Expand the explicitly-specified destinations with every destination key
/// named in `journal` that is not already covered, by re-parsing each key
/// as a destination string (`--locked-dests`). Keys that fail to parse are
/// logged and skipped.
pub fn expand_locked_destinations(
    explicit: Vec<Destination>,
    journal: &LockJournal,
    opts: &DestinationOptions,
) -> Vec<Destination> {
    let mut known_keys: BTreeSet<String> = explicit.iter().map(Destination::key).collect();
    let mut destinations = explicit;

    let journal_keys: BTreeSet<String> = journal
        .locked_basenames()
        .flat_map(|b| journal.outstanding_for(b).map(str::to_string))
        .collect();

    for key in journal_keys {
        if known_keys.contains(&key) {
            continue;
        }

        match parse_destination(&key, opts) {
            Ok(destination) => {
                known_keys.insert(key);
                destinations.push(destination);
            }
            Err(err) => {
                warn!("lock journal references unknown destination \"{key}\": {err}");
            }
        }
    }

    destinations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_args_strips_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("args.txt");
        std::fs::write(&file, "--quiet\n\n# a comment\n  /backup\n").unwrap();

        let args = vec![format!("@{}", file.display())];
        let mut out = Vec::new();
        expand_args(&args, &mut out, 0).unwrap();

        assert_eq!(out, vec!["--quiet".to_string(), "/backup".to_string()]);
    }

    #[test]
    fn parse_destination_recognizes_all_three_schemes() {
        let opts = DestinationOptions::default();
        assert!(matches!(
            parse_destination("/backup", &opts).unwrap(),
            Destination::Local(_)
        ));
        assert!(matches!(
            parse_destination("ssh://nas/backup", &opts).unwrap(),
            Destination::Ssh(_)
        ));
        assert!(matches!(
            parse_destination("shell://cat > out.img", &opts).unwrap(),
            Destination::Shell(_)
        ));
    }

    #[test]
    fn parse_ssh_destination_roundtrips_through_key() {
        let destination =
            parse_destination("ssh://backup@nas:2222/backups", &DestinationOptions::default())
                .unwrap();
        assert_eq!(destination.key(), "ssh://backup@nas:2222/backups");
    }

    #[test]
    fn relative_local_path_is_rejected() {
        assert!(parse_destination("relative/path", &DestinationOptions::default()).is_err());
    }

    #[test]
    fn expand_locked_destinations_adds_only_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LockJournal::load(dir.path().join(".outstanding_transfers")).unwrap();
        journal.lock("X", "/already-known");
        journal.lock("X", "/discovered");

        let opts = DestinationOptions::default();
        let explicit = vec![parse_destination("/already-known", &opts).unwrap()];
        let expanded = expand_locked_destinations(explicit, &journal, &opts);

        let keys: BTreeSet<String> = expanded.iter().map(Destination::key).collect();
        assert_eq!(
            keys,
            BTreeSet::from(["/already-known".to_string(), "/discovered".to_string()])
        );
    }
}
