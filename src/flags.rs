use crate::trace::FrameTime;
use std::sync::Mutex;

/// When to compute memory checksums during replay: at every syscall exit,
/// at every event, or starting from a given trace time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Checksum {
    ChecksumSyscall,
    ChecksumAll,
    ChecksumAt(FrameTime),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DumpOn {
    DumpOnAll,
    DumpOnSignal(i32),
    DumpOnSyscall(i32),
}

/// Process-global configuration. An embedding front-end builds a `Flags`
/// (usually from [`crate::options::ReplayOptions`]) and installs it with
/// `Flags::init` before the first `Flags::get`; after that the record is
/// immutable for the life of the process.
#[derive(Clone, Default)]
pub struct Flags {
    /// Replay without a debugger server attached.
    pub autopilot: bool,
    /// Port the debugger server listens on.
    pub dbgport: Option<i32>,
    /// When to generate or check memory checksums.
    pub checksum: Option<Checksum>,
    pub dump_on: Option<DumpOn>,
    pub dump_at: Option<FrameTime>,
    /// Force the engine to do things that it otherwise wouldn't, for
    /// example continuing past a tick-count divergence that is known to be
    /// unrecoverable.
    pub force_things: bool,
    /// Suppress warnings related to environmental features outside the
    /// engine's control.
    pub suppress_environment_warnings: bool,
    /// Send tracee stdio through the real fds instead of emulating.
    pub redirect: bool,
    /// User override for microarchitecture detection, e.g. when running
    /// under valgrind.
    pub forced_uarch: Option<String>,
    /// Also count page faults, hardware interrupts and retired
    /// instructions alongside ticks.
    pub extra_perf_counters: bool,
}

lazy_static! {
    static ref PENDING_FLAGS: Mutex<Option<Flags>> = Mutex::new(None);
    static ref FLAGS: Flags = PENDING_FLAGS.lock().unwrap().take().unwrap_or_default();
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    /// Install the process-wide flags. Has no effect once `get()` has
    /// resolved them, so front-ends must call this first thing.
    pub fn init(flags: Flags) {
        *PENDING_FLAGS.lock().unwrap() = Some(flags);
        lazy_static::initialize(&FLAGS);
    }
}
