use crate::flags::{Checksum, DumpOn, Flags};
use crate::trace::FrameTime;
use std::error::Error;
use structopt::{clap, StructOpt};

/// The replay configuration surface, in a shape a command-line front-end
/// can `flatten` into its own parser. Convert with [`ReplayOptions::into_flags`]
/// and install via [`Flags::init`].
#[derive(Debug, StructOpt)]
#[structopt(name = "retrace-replay", about = "Replay options for the retrace engine core")]
pub struct ReplayOptions {
    /// Replay without a debugger server.
    #[structopt(short = "a", long = "autopilot")]
    pub autopilot: bool,

    /// Listen for a debugger connection on <port>.
    #[structopt(short = "s", long = "dbgport")]
    pub dbgport: Option<i32>,

    /// Force the engine to assume it's running on a CPU with microarch
    /// <microarch> even if runtime detection says otherwise. <microarch>
    /// should be a string like 'Ivy Bridge'. Intel Merom and Penryn are
    /// not supported.
    #[structopt(short = "A", long = "microarch")]
    pub microarch: Option<String>,

    /// Force the engine to do some things that don't seem like good ideas,
    /// for example continuing past a tick-count divergence that is known
    /// to be unrecoverable.
    #[structopt(short = "F", long = "force-things")]
    pub force_things: bool,

    /// Suppress warnings about issues in the environment that the engine
    /// has no control over.
    #[structopt(short = "S", long = "suppress-environmental-warnings")]
    pub suppress_environment_warnings: bool,

    /// Dump memory at global time point <time>.
    #[structopt(short = "T", long = "dump-at")]
    pub dump_at: Option<FrameTime>,

    /// Where <dump_on> := `ALL` | <syscall-no> | -<signal-no>. Dump memory
    /// whenever the matching event is replayed.
    #[structopt(short = "D", long = "dump-on", parse(try_from_str = parse_dump_on))]
    pub dump_on: Option<DumpOn>,

    /// Where <checksum> := `on-syscalls` | `on-all-events` | <from-time>.
    /// Verify checksums of each of the tracee's memory mappings either at
    /// the end of all syscalls (`on-syscalls`), at all events
    /// (`on-all-events`), or starting from a global timepoint <from-time>.
    #[structopt(short = "C", long = "checksum", parse(try_from_str = parse_checksum))]
    pub checksum: Option<Checksum>,

    /// Send tracee stdout/stderr writes through the real fds.
    #[structopt(short = "r", long = "redirect")]
    pub redirect: bool,

    /// Also count page faults, hardware interrupts and retired
    /// instructions alongside ticks.
    #[structopt(long = "extra-counters")]
    pub extra_perf_counters: bool,
}

impl ReplayOptions {
    pub fn into_flags(self) -> Flags {
        Flags {
            autopilot: self.autopilot,
            dbgport: self.dbgport,
            checksum: self.checksum,
            dump_on: self.dump_on,
            dump_at: self.dump_at,
            force_things: self.force_things,
            suppress_environment_warnings: self.suppress_environment_warnings,
            redirect: self.redirect,
            forced_uarch: self.microarch,
            extra_perf_counters: self.extra_perf_counters,
        }
    }
}

fn parse_checksum(checksum_s: &str) -> Result<Checksum, Box<dyn Error>> {
    if checksum_s == "on-syscalls" {
        Ok(Checksum::ChecksumSyscall)
    } else if checksum_s == "on-all-events" {
        Ok(Checksum::ChecksumAll)
    } else if checksum_s.chars().all(|c| !c.is_ascii_digit()) {
        Err(Box::new(clap::Error::with_description(
            "Only `on-syscalls` or `on-all-events` or an unsigned integer is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    } else {
        Ok(Checksum::ChecksumAt(checksum_s.parse::<FrameTime>()?))
    }
}

fn parse_dump_on(dump_on_s: &str) -> Result<DumpOn, Box<dyn Error>> {
    if dump_on_s == "ALL" {
        Ok(DumpOn::DumpOnAll)
    } else if dump_on_s.chars().all(|c| c.is_ascii_digit() || c == '-') {
        let signal_or_syscall = dump_on_s.parse::<i32>()?;
        if signal_or_syscall < 0 {
            Ok(DumpOn::DumpOnSignal(-signal_or_syscall))
        } else {
            Ok(DumpOn::DumpOnSyscall(signal_or_syscall))
        }
    } else {
        Err(Box::new(clap::Error::with_description(
            "Only `ALL` or an integer value is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_parsing() {
        assert_eq!(
            Checksum::ChecksumSyscall,
            parse_checksum("on-syscalls").unwrap()
        );
        assert_eq!(
            Checksum::ChecksumAll,
            parse_checksum("on-all-events").unwrap()
        );
        assert_eq!(Checksum::ChecksumAt(1234), parse_checksum("1234").unwrap());
        assert!(parse_checksum("sometimes").is_err());
    }

    #[test]
    fn dump_on_parsing() {
        assert_eq!(DumpOn::DumpOnAll, parse_dump_on("ALL").unwrap());
        assert_eq!(DumpOn::DumpOnSyscall(42), parse_dump_on("42").unwrap());
        assert_eq!(DumpOn::DumpOnSignal(9), parse_dump_on("-9").unwrap());
        assert!(parse_dump_on("RDTSC-ish").is_err());
    }

    #[test]
    fn options_convert_to_flags() {
        let opts = ReplayOptions::from_iter(&[
            "retrace-replay",
            "-a",
            "-A",
            "Skylake",
            "--checksum",
            "on-syscalls",
        ]);
        let flags = opts.into_flags();
        assert!(flags.autopilot);
        assert_eq!(Some("Skylake".to_owned()), flags.forced_uarch);
        assert_eq!(Some(Checksum::ChecksumSyscall), flags.checksum);
        assert!(!flags.force_things);
    }
}
