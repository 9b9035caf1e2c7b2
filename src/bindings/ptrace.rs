use libc::c_uint;

/// Not part of the official ptrace-request enum; x86-only.
pub const PTRACE_SYSEMU: c_uint = 31;
pub const PTRACE_SYSEMU_SINGLESTEP: c_uint = 32;
