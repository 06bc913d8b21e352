//! Endpoint abstraction: an ordered set of snapshots living somewhere, with
//! list/receive/delete primitives.
//!
//! Capability is modeled statically rather than with runtime no-ops: a
//! write-only endpoint such as [`ShellEndpoint`] simply never implements
//! [`ReadableEndpoint`], so the coordinator and retention planner cannot
//! accidentally call `list()` on one and get a silently-empty answer back —
//! the type system keeps "this endpoint has no notion of what it already
//! holds" and "this endpoint is empty right now" distinct.
//!
//! `receive` is expressed as a [`PipelineStage`] rather than a `Read`-based
//! method: a transfer is always "source's `btrfs send` piped into this
//! endpoint's receiver", and building it as one continuous
//! [`crate::pipeline::Pipeline`] keeps the no-buffering guarantee end to
//! end instead of funneling bytes through an intermediate reader.

pub mod local;
pub mod shell;
pub mod source;
pub mod ssh;

use std::collections::BTreeSet;

use crate::backup_error::BackupError;
use crate::pipeline::PipelineStage;

pub use local::LocalEndpoint;
pub use shell::ShellEndpoint;
pub use source::SourceEndpoint;
pub use ssh::SshEndpoint;

/// Operations every destination endpoint supports, whether or not it can
/// also be listed.
pub trait Endpoint {
    /// The stable string identity used as a lock-journal key, e.g. an
    /// absolute path or a canonical `ssh://user@host:port/path` URL.
    fn key(&self) -> String;

    /// The final pipeline stage that materializes `basename` from whatever
    /// stdin it is fed (the preceding stage's `btrfs send` output).
    /// `parent` is the incremental parent chosen for this transfer, if any;
    /// only `ShellEndpoint` makes use of it (as `BACKUP_PARENT`).
    fn receive_stage(&self, basename: &str, parent: Option<&str>) -> PipelineStage;

    /// Remove `basename`. Succeeds silently if it is already absent.
    fn delete(&self, basename: &str) -> Result<(), BackupError>;
}

/// An endpoint that can report which snapshots it currently stores.
/// `ShellEndpoint` does not implement this: its `list()` is conceptually
/// "always empty", which the planning step computes directly rather than by
/// calling a real listing method.
pub trait ReadableEndpoint: Endpoint {
    /// Enumerate basenames currently stored, filtered to the active prefix.
    /// Fails with `EndpointUnavailable` on I/O error.
    fn list(&self) -> Result<BTreeSet<String>, BackupError>;
}

/// A concrete destination, resolved from a CLI destination string.
pub enum Destination {
    Local(LocalEndpoint),
    Ssh(SshEndpoint),
    Shell(ShellEndpoint),
}

impl Destination {
    pub fn key(&self) -> String {
        match self {
            Destination::Local(e) => e.key(),
            Destination::Ssh(e) => e.key(),
            Destination::Shell(e) => e.key(),
        }
    }

    pub fn delete(&self, basename: &str) -> Result<(), BackupError> {
        match self {
            Destination::Local(e) => e.delete(basename),
            Destination::Ssh(e) => e.delete(basename),
            Destination::Shell(e) => e.delete(basename),
        }
    }

    /// The destination's current snapshot set, or the empty set for a
    /// write-only (shell) destination, which never tracks what it holds.
    pub fn list(&self) -> Result<BTreeSet<String>, BackupError> {
        match self {
            Destination::Local(e) => e.list(),
            Destination::Ssh(e) => e.list(),
            Destination::Shell(_) => Ok(BTreeSet::new()),
        }
    }

    pub fn receive_stage(&self, basename: &str, parent: Option<&str>) -> PipelineStage {
        match self {
            Destination::Local(e) => e.receive_stage(basename, parent),
            Destination::Ssh(e) => e.receive_stage(basename, parent),
            Destination::Shell(e) => e.receive_stage(basename, parent),
        }
    }
}
