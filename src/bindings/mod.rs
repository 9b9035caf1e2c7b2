//! Kernel ABI constants that neither `libc` nor the perf bindings export.

pub mod fcntl;
pub mod ptrace;
