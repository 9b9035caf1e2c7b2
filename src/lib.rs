//! Core of a deterministic user-space record-and-replay engine for Linux.
//!
//! Two subsystems live here. The first is the hardware performance counter
//! abstraction ([`perf_counters`]): it gives the engine a reproducible
//! notion of logical time inside a tracee (a "tick" is one retired
//! conditional branch executed in user mode) and can raise an asynchronous
//! signal once a programmed tick budget has elapsed. The second is the
//! replay-time debugger engine ([`replayer`] and [`diversion`]): it drives a
//! traced process forward one trace frame at a time, services debugger
//! requests between frames, and can fork a *diversion* — a mutable,
//! non-recorded sibling of the replay in which the debugger may run
//! arbitrary code without corrupting the replay timeline.
//!
//! Everything around these two subsystems is a collaborator reached through
//! a trait: trace decoding ([`trace::TraceReader`]), the recorder's syscall
//! and signal event tables ([`replayer::SyscallReplayer`],
//! [`replayer::SignalReplayer`]), memory dumping and checksumming
//! ([`replayer::MemoryChecker`]), and the debugger transport
//! ([`dbg_connection::DbgConnection`]). A front-end embeds the engine by
//! parsing [`options::ReplayOptions`], installing them with
//! [`flags::Flags::init`], and handing a [`replayer::ReplayController`] its
//! collaborators.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod bindings;
pub mod dbg_connection;
pub mod diversion;
pub mod flags;
pub mod kernel_metadata;
pub mod options;
pub mod perf_counters;
pub mod registers;
pub mod remote_ptr;
pub mod replayer;
pub mod scheduler;
pub mod scoped_fd;
pub mod task;
pub mod ticks;
pub mod trace;
pub mod util;
pub mod wait_status;

#[cfg(test)]
pub(crate) mod test_support;
