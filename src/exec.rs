//! Thin re-export point for the process-execution abstraction used by the
//! non-streaming, always-local btrfs calls (creating and deleting snapshots
//! on the source subvolume).
//!
//! Large `btrfs send`/`btrfs receive` streams, and everything that talks to
//! an SSH destination, never go through this: see [`crate::pipeline`] for
//! why those are wired with raw child-process pipes instead of a
//! captured-`String` executor. This crate only ever constructs
//! `exec_rs::Context::Local` — the source subvolume this tool backs up is
//! always local (pulling from a remote source is an explicit non-goal) — so
//! the ambiguity in the retrieved pack around the shape of `Context::Remote`
//! (see DESIGN.md) never has to be resolved.
pub use exec_rs::{CommandExec, Context, Exec, ExecError};

#[cfg(test)]
pub use exec_rs::MockExec;

pub fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| String::from("root"))
}
