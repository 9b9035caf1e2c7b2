use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use libc::pid_t;

/// Global trace times. Each recorded event gets a unique, monotonically
/// increasing time.
pub type FrameTime = u64;

// Pseudo-events share the `stop_reason` encoding with syscall numbers and
// (negated) signal numbers; they sit far above any real syscall.

/// The recorder set up a scratch region for the tracee.
pub const USR_INIT_SCRATCH_MEM: i32 = 0x10000;
/// The tracee exited; the frame's thread no longer exists.
pub const USR_EXIT: i32 = 0x10001;
/// One queued flush of the recorder's syscall buffer.
pub const USR_FLUSH: i32 = 0x10002;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    Entry,
    Exit,
}

/// One entry of the recorded trace: what stopped the tracee, when, and the
/// register file captured at the stop.
///
/// `stop_reason` is a syscall number, a negated signal number, or one of
/// the `USR_*` pseudo-events.
#[derive(Copy, Clone)]
pub struct TraceFrame {
    pub global_time: FrameTime,
    pub tid: pid_t,
    pub stop_reason: i32,
    pub state: SyscallState,
    pub recorded_regs: Registers,
}

impl Default for TraceFrame {
    fn default() -> Self {
        TraceFrame {
            global_time: 0,
            tid: 0,
            stop_reason: 0,
            state: SyscallState::Entry,
            recorded_regs: Registers::new(),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TraceStepAction {
    /// The frame is fully processed; nothing left to execute.
    Retire,
    /// Advance the tracee to the next syscall entry.
    EnterSyscall,
    /// Advance the tracee past the syscall exit.
    ExitSyscall,
}

impl Default for TraceStepAction {
    fn default() -> Self {
        TraceStepAction::Retire
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct SyscallStep {
    pub no: i32,
    /// True when the syscall is emulated rather than executed.
    pub emu: bool,
    /// How many recorded memory arguments to push back into the tracee.
    pub num_emu_args: usize,
    /// True when the recorded return value must be injected.
    pub emu_ret: bool,
}

/// What the trace-interpretation code wants done to retire the current
/// frame.
#[derive(Copy, Clone, Default, Debug)]
pub struct TraceStep {
    pub action: TraceStepAction,
    pub syscall: SyscallStep,
}

/// A recorded file mapping, as stored alongside the frame that created it.
#[derive(Copy, Clone, Debug)]
pub struct MmappedFile {
    pub start: RemotePtr<u8>,
    pub end: RemotePtr<u8>,
}

impl MmappedFile {
    pub fn num_bytes(&self) -> usize {
        self.end.as_uint() - self.start.as_uint()
    }
}

/// One recorded block of tracee memory, to be written back during replay.
#[derive(Clone, Debug, Default)]
pub struct RawDataRecord {
    pub addr: RemotePtr<u8>,
    pub data: Vec<u8>,
}

/// The decoded trace stream. The on-disk format and its decoding live
/// outside this crate; the replay loop only consumes frames and their
/// attached records, strictly in recorded order.
pub trait TraceReader {
    /// The next frame, or `None` at end of trace.
    fn next_frame(&mut self) -> Option<TraceFrame>;
    /// The mmapped-file record attached to the current frame.
    fn next_mmapped_file(&mut self) -> MmappedFile;
    /// The next recorded memory block attached to the current frame.
    fn next_raw_data(&mut self) -> RawDataRecord;
}
