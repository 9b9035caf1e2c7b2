use crate::dbg_connection::{DbgConnection, DbgRequest, DbgServer, DbgThreadId};
use crate::diversion::DiversionSession;
use crate::flags::{Checksum, DumpOn, Flags};
use crate::kernel_metadata::signal_name;
use crate::log::LogLevel::{LogError, LogInfo, LogWarn};
use crate::registers::compare_register_files;
use crate::remote_ptr::RemotePtr;
use crate::scheduler::Scheduler;
use crate::task::{ResumeRequest, Task};
use crate::trace::{
    MmappedFile, SyscallState, TraceStep, TraceStepAction, USR_EXIT, USR_FLUSH,
    USR_INIT_SCRATCH_MEM,
};

/// The one-byte trap instruction overwriting the target of a software
/// breakpoint.
pub const BREAKPOINT_INSN: u8 = 0xCC;

const MAX_NUM_BREAKPOINTS: usize = 128;

/// Interprets syscall frames against the recorder's event tables. Lives
/// outside the core; `process_syscall` fills in the `TraceStep` the
/// dispatch loop executes.
pub trait SyscallReplayer {
    fn process_syscall(&mut self, t: &mut dyn Task, redirect: bool, step: &mut TraceStep);
    /// Replay one queued flush of the recorder's syscall buffer.
    fn process_flush(&mut self, t: &mut dyn Task);
}

/// Replays signal frames, using the ticks counter to land asynchronous
/// signals on the recorded instruction.
pub trait SignalReplayer {
    fn process_signal(&mut self, t: &mut dyn Task, validate: bool);
}

/// Dumps and checksums tracee memory on demand, and tracks scratch ranges
/// that must be skipped when checksumming.
pub trait MemoryChecker {
    fn dump_process_memory(&mut self, t: &mut dyn Task, tag: &str);
    fn validate_process_memory(&mut self, t: &mut dyn Task);
    fn note_scratch_region(&mut self, start: RemotePtr<u8>, num_bytes: usize);
}

#[derive(Copy, Clone)]
struct Breakpoint {
    addr: RemotePtr<u8>,
    overwritten_data: u8,
}

/// Software breakpoints: one byte of tracee text swapped for the trap
/// instruction. Entries have unique, non-null addresses; a removed entry
/// is zeroed.
pub struct BreakpointTable {
    table: [Option<Breakpoint>; MAX_NUM_BREAKPOINTS],
}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        BreakpointTable {
            table: [None; MAX_NUM_BREAKPOINTS],
        }
    }

    fn find(&self, addr: RemotePtr<u8>) -> Option<&Breakpoint> {
        self.table
            .iter()
            .flatten()
            .find(|bp| bp.addr == addr)
    }

    pub fn is_set(&self, addr: RemotePtr<u8>) -> bool {
        self.find(addr).is_some()
    }

    pub fn set(&mut self, t: &mut dyn Task, addr: RemotePtr<u8>) {
        debug_assert!(!addr.is_null());
        debug_assert!(!self.is_set(addr));

        let data = t.read_mem(addr, 1);
        t.write_mem(addr, &[BREAKPOINT_INSN]);

        match self.table.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(Breakpoint {
                    addr,
                    overwritten_data: data[0],
                });
            }
            None => {
                fatal!("Out of breakpoints");
            }
        }
    }

    pub fn remove(&mut self, t: &mut dyn Task, addr: RemotePtr<u8>) {
        let overwritten_data = match self.find(addr) {
            Some(bp) => bp.overwritten_data,
            None => {
                log!(LogWarn, "Couldn't find breakpoint {} to remove", addr);
                return;
            }
        };
        t.write_mem(addr, &[overwritten_data]);

        for slot in self.table.iter_mut() {
            if let Some(bp) = slot {
                if bp.addr == addr {
                    *slot = None;
                    break;
                }
            }
        }
    }

    /// True when `ip` is one byte past a set breakpoint, i.e. the position
    /// of the instruction pointer after the trap fired.
    pub fn eip_is_breakpoint(&self, ip: RemotePtr<u8>) -> bool {
        if ip.is_null() {
            return false;
        }
        self.is_set(ip - 1)
    }
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The replay-time dispatch engine. Owns the scheduled tasks (through the
/// scheduler), the debugger connection, the breakpoint table, and the
/// current diversion session if any. Single-threaded: every traced child
/// is driven from the thread that calls [`ReplayController::replay`].
pub struct ReplayController {
    pub(crate) scheduler: Scheduler,
    pub(crate) dbg: Option<Box<dyn DbgConnection>>,
    pub(crate) dbg_server: Box<dyn DbgServer>,
    pub(crate) syscall_replayer: Box<dyn SyscallReplayer>,
    pub(crate) signal_replayer: Box<dyn SignalReplayer>,
    pub(crate) memory_checker: Box<dyn MemoryChecker>,
    pub(crate) breakpoints: BreakpointTable,
    /// Set once the first execve exit has been observed; before that the
    /// process image is still the engine's own and neither register
    /// validation nor debugger servicing makes sense.
    pub(crate) validate: bool,
    /// The current diversion session. At most one exists at a time.
    pub(crate) diversion: Option<DiversionSession>,
}

impl ReplayController {
    pub fn new(
        scheduler: Scheduler,
        dbg_server: Box<dyn DbgServer>,
        syscall_replayer: Box<dyn SyscallReplayer>,
        signal_replayer: Box<dyn SignalReplayer>,
        memory_checker: Box<dyn MemoryChecker>,
    ) -> ReplayController {
        ReplayController {
            scheduler,
            dbg: None,
            dbg_server,
            syscall_replayer,
            signal_replayer,
            memory_checker,
            breakpoints: BreakpointTable::new(),
            validate: false,
            diversion: None,
        }
    }

    /// Replay the whole trace. Unless on autopilot, waits for a debugger
    /// client first and services it between frames.
    pub fn replay(&mut self) {
        if !Flags::get().autopilot {
            let port = Flags::get().dbgport.unwrap_or(0);
            self.dbg = Some(self.dbg_server.await_client_connection(port));
        }

        self.replay_loop();
    }

    pub(crate) fn replay_loop(&mut self) {
        while self.scheduler.num_threads() > 0 {
            match self.scheduler.get_thread() {
                Some(mut t) => {
                    if self.replay_one_trace_frame(&mut *t) {
                        self.scheduler.put_thread(t);
                    } else {
                        self.scheduler.deregister_thread(t);
                    }
                }
                None => {
                    fatal!(
                        "Trace ended with {} threads still scheduled",
                        self.scheduler.num_threads()
                    );
                }
            }
        }

        if let Some(dbg) = self.dbg.as_mut() {
            dbg.notify_exit_code(0);
        }
        log!(LogInfo, "Replayer successfully finished.");
    }

    /// Advance `t` by one trace frame. Returns false when the frame was the
    /// task's exit and the task must be deregistered.
    pub(crate) fn replay_one_trace_frame(&mut self, t: &mut dyn Task) -> bool {
        // Advance the trace until we've exec()'d the tracee before
        // processing debugger requests. Otherwise the debugger host will be
        // confused about the initial executable image.
        let mut req = DbgRequest::ResumeContinue;
        if self.validate {
            req = self.process_debugger_requests(t);
            debug_assert!(req.is_resume_request());
        }

        if t.frame().global_time % 10000 == 0 {
            log!(LogInfo, "time: {}", t.frame().global_time);
        }

        // A signal carried over from the previous frame must be the one the
        // trace says stops this frame.
        if t.pending_sig() != 0 {
            ed_assert!(
                &*t,
                t.frame().stop_reason == -t.pending_sig(),
                "Carried-over {} does not match the frame's stop reason {}",
                signal_name(t.pending_sig()),
                t.frame().stop_reason
            );
            t.set_pending_sig(0);
        }

        // Ask the trace-interpretation code what to do next in order to
        // retire the current frame.
        let mut step = TraceStep::default();
        let stop_reason = t.frame().stop_reason;
        if stop_reason == USR_INIT_SCRATCH_MEM {
            // For checksumming: make a note that this area is scratch and
            // need not be validated.
            let file = self.scheduler.trace_mut().next_mmapped_file();
            self.replay_init_scratch_memory(t, &file);
            self.memory_checker.note_scratch_region(
                RemotePtr::new_from_val(t.frame().recorded_regs.syscall_result() as usize),
                file.num_bytes(),
            );
            step.action = TraceStepAction::Retire;
        } else if stop_reason == USR_EXIT {
            // Early-return because the task is gone now.
            return false;
        } else if stop_reason == USR_FLUSH {
            self.syscall_replayer.process_flush(t);
            step.action = TraceStepAction::Retire;
        } else if stop_reason < 0 {
            // The stop reason is a signal; landing it on the recorded
            // instruction takes the ticks counter.
            self.signal_replayer.process_signal(t, self.validate);
            step.action = TraceStepAction::Retire;
        } else {
            // The stop reason is a syscall.
            self.validate |= t.frame().state == SyscallState::Exit
                && stop_reason == libc::SYS_execve as i32;
            self.syscall_replayer
                .process_syscall(t, Flags::get().redirect, &mut step);
        }

        // Advance until `step` has been fulfilled.
        while self.try_one_trace_step(t, &step, &req) != 0 {
            ed_assert!(&*t, libc::SIGTRAP == t.pending_sig(), "Unknown trap");

            // Only software breakpoints and successful stepi's are
            // understood here. The response in both cases is the same, so
            // just make sure we saw an action we were expecting. A SIGTRAP
            // from a TF flag this engine did not request also lands here
            // and fails the assertion deliberately: an unexplained trap is
            // indistinguishable from replay divergence.
            let at_breakpoint = {
                let ip = t.regs().ip();
                self.breakpoints.eip_is_breakpoint(ip)
            };
            ed_assert!(
                &*t,
                at_breakpoint || matches!(req, DbgRequest::ResumeStep(target) if target == t.rec_tid()),
                "Stopped at a trap that is neither a breakpoint nor a requested stepi"
            );

            // Notify the debugger and process any new requests that might
            // have triggered before resuming.
            self.notify_stop(t.rec_tid(), libc::SIGTRAP, RemotePtr::null());
            req = self.process_debugger_requests(t);
            debug_assert!(req.is_resume_request());
        }

        // Every time a non-buffered event retires, the ticks counter is
        // re-armed; buffered flushes must leave it running so the next
        // interrupt interval stays anchored at the last real event.
        if stop_reason != USR_FLUSH {
            t.reset_hpc(0);
        }
        self.debug_memory(t);
        true
    }

    /// Reserve the recorded scratch range with a PROT_NONE anonymous
    /// mapping, so the replayed address map matches the recorded one while
    /// rogue reads or writes of scratch memory fault.
    fn replay_init_scratch_memory(&mut self, t: &mut dyn Task, file: &MmappedFile) {
        let orig_regs = t.regs();

        let mut mmap_call = orig_regs;
        mmap_call.set_syscallno(libc::SYS_mmap);
        mmap_call.set_arg1(file.start.as_uint() as u64);
        mmap_call.set_arg2(file.num_bytes() as u64);
        mmap_call.set_arg3(libc::PROT_NONE as u64);
        mmap_call.set_arg4((libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64);
        mmap_call.set_arg5(-1i64 as u64);
        mmap_call.set_arg6(0);

        t.inject_and_execute_syscall(&mmap_call);
    }

    /// Reply to debugger requests until the debugger asks us to resume
    /// execution.
    pub(crate) fn process_debugger_requests(&mut self, t: &mut dyn Task) -> DbgRequest {
        if self.dbg.is_none() {
            return DbgRequest::ResumeContinue;
        }
        let mut maybe_req: Option<DbgRequest> = None;
        loop {
            let req = match maybe_req.take() {
                Some(req) => req,
                None => self.dbg.as_mut().unwrap().get_request(),
            };
            if req.is_resume_request() {
                return req;
            }

            if let DbgRequest::ReadSigInfo(len) = req {
                let si_bytes = vec![0u8; len];
                self.dbg.as_mut().unwrap().reply_read_siginfo(&si_bytes);

                // READ_SIGINFO marks the start of a diversion. The first
                // request the diversion rejects belongs to this session and
                // is processed on the next turn of this loop.
                maybe_req = self.divert(t);
                continue;
            }

            self.dispatch_debugger_request(t, &req);
        }
    }

    /// Service one non-resume debugger request against `t`. Shared between
    /// the replay loop and a live diversion, which passes its own task.
    pub(crate) fn dispatch_debugger_request(&mut self, t: &mut dyn Task, req: &DbgRequest) {
        let dbg = match self.dbg.as_mut() {
            Some(dbg) => dbg,
            None => return,
        };
        match req {
            DbgRequest::GetCurrentThread => {
                dbg.reply_get_current_thread(t.rec_tid());
            }
            DbgRequest::GetIsThreadAlive(tid) => {
                let alive = *tid == t.rec_tid() || self.scheduler.is_thread_alive(*tid);
                dbg.reply_get_is_thread_alive(alive);
            }
            DbgRequest::GetMem(addr, len) => {
                let mem = t.read_mem(*addr, *len);
                dbg.reply_get_mem(&mem);
            }
            DbgRequest::GetOffsets => {
                dbg.reply_get_offsets();
            }
            DbgRequest::GetReg(_, reg) => {
                let regs = t.regs();
                let value = regs.read_register(*reg);
                dbg.reply_get_reg(crate::registers::DbgRegValue {
                    reg: *reg,
                    value,
                    defined: true,
                });
            }
            DbgRequest::GetRegs(_) => {
                let file = t.regs().debugger_register_file();
                dbg.reply_get_regs(&file);
            }
            DbgRequest::GetStopReason(target) => {
                if *target <= 0 || *target == t.rec_tid() {
                    dbg.reply_get_stop_reason(t.rec_tid(), t.pending_sig());
                } else {
                    match self.scheduler.find_task(*target) {
                        Some(other) => {
                            let (rec_tid, sig) = (other.rec_tid(), other.pending_sig());
                            dbg.reply_get_stop_reason(rec_tid, sig);
                        }
                        None => dbg.reply_get_stop_reason(-1, -1),
                    }
                }
            }
            DbgRequest::GetThreadList => {
                let mut threads: Vec<DbgThreadId> = self.scheduler.thread_list();
                if !threads.contains(&t.rec_tid()) {
                    threads.push(t.rec_tid());
                    threads.sort_unstable();
                }
                dbg.reply_get_thread_list(&threads);
            }
            DbgRequest::Interrupt => {
                // Tell the debugger we stopped and await further
                // instructions.
                dbg.notify_stop(t.rec_tid(), 0, RemotePtr::null());
            }
            DbgRequest::SetSwBreak(addr, len) => {
                debug_assert_eq!(1, *len);
                self.breakpoints.set(t, *addr);
                self.dbg.as_mut().unwrap().reply_watchpoint_request(0);
            }
            DbgRequest::RemoveSwBreak(addr, len) => {
                debug_assert_eq!(1, *len);
                self.breakpoints.remove(t, *addr);
                self.dbg.as_mut().unwrap().reply_watchpoint_request(0);
            }
            DbgRequest::SetHwBreak(..)
            | DbgRequest::RemoveHwBreak(..)
            | DbgRequest::SetRdWatch(..)
            | DbgRequest::RemoveRdWatch(..)
            | DbgRequest::SetWrWatch(..)
            | DbgRequest::RemoveWrWatch(..)
            | DbgRequest::SetRdWrWatch(..)
            | DbgRequest::RemoveRdWrWatch(..) => {
                // Hardware breakpoints and watchpoints are not supported.
                dbg.reply_watchpoint_request(-1);
            }
            DbgRequest::WriteSigInfo(_) => {
                log!(LogWarn, "WRITE_SIGINFO outside a diversion; ignored");
                dbg.reply_write_siginfo();
            }
            _ => {
                fatal!("Unknown debugger request {:?}", req);
            }
        }
    }

    /// Compare the current register file against the one captured at
    /// recording time. A mismatch means replay has diverged; hand the task
    /// to an emergency debugger.
    fn validate_args(&mut self, syscall: i32, state: SyscallState, t: &mut dyn Task) {
        // Don't validate anything before execve is done as the actual
        // process did not start prior to this point.
        if !self.validate {
            return;
        }
        let cur_regs = t.regs();
        let recorded_regs = t.frame().recorded_regs;
        if compare_register_files("syscall now", &cur_regs, "recorded", &recorded_regs) > 0 {
            log!(
                LogError,
                "Register mismatch at syscall {}, state {:?}, time {}",
                syscall,
                state,
                t.frame().global_time
            );
            self.emergency_debug(t);
        }
    }

    /// Continue until reaching either the "entry" of an emulated syscall,
    /// or the entry or exit of an executed syscall. Returns 0 when the next
    /// syscall boundary is reached, or nonzero if advancing to the boundary
    /// was interrupted by an unknown trap.
    fn cont_syscall_boundary(&mut self, t: &mut dyn Task, emu: bool, stepi: bool) -> i32 {
        loop {
            let how = match (emu, stepi) {
                (true, true) => ResumeRequest::ResumeSysemuSinglestep,
                (true, false) => ResumeRequest::ResumeSysemu,
                (false, true) => ResumeRequest::ResumeSinglestep,
                (false, false) => ResumeRequest::ResumeSyscall,
            };
            t.resume_execution(how, 0);
            t.wait();

            match t.pending_sig() {
                0 => break,
                libc::SIGCHLD => {
                    // A SIGCHLD is pending; do not deliver it, wait for it
                    // to appear in the trace. SIGCHLD is the only signal
                    // that should ever be generated as all other signals
                    // are emulated.
                    continue;
                }
                libc::SIGTRAP => return 1,
                sig => {
                    log!(LogError, "Replay got unrecorded signal {}", signal_name(sig));
                    self.emergency_debug(t);
                }
            }
        }

        debug_assert_eq!(0, t.pending_sig());
        0
    }

    /// Advance to the next syscall entry (or virtual entry) according to
    /// `step`.
    fn enter_syscall(&mut self, t: &mut dyn Task, step: &TraceStep, stepi: bool) -> i32 {
        let ret = self.cont_syscall_boundary(t, step.syscall.emu, stepi);
        if ret != 0 {
            return ret;
        }
        self.validate_args(step.syscall.no, SyscallState::Entry, t);
        0
    }

    /// Advance past the reti (or virtual reti) according to `step`.
    fn exit_syscall(&mut self, t: &mut dyn Task, step: &TraceStep, stepi: bool) -> i32 {
        let emu = step.syscall.emu;

        if !emu {
            let ret = self.cont_syscall_boundary(t, emu, stepi);
            if ret != 0 {
                return ret;
            }
        }

        for _ in 0..step.syscall.num_emu_args {
            self.set_child_data(t);
        }
        if step.syscall.emu_ret {
            let mut regs = t.regs();
            regs.set_syscall_result(t.frame().recorded_regs.syscall_result());
            t.set_regs(&regs);
        }
        self.validate_args(step.syscall.no, SyscallState::Exit, t);

        if emu {
            t.finish_emulated_syscall();
        }
        0
    }

    /// Push the next recorded memory block into the child.
    fn set_child_data(&mut self, t: &mut dyn Task) {
        let record = self.scheduler.trace_mut().next_raw_data();
        if !record.data.is_empty() {
            t.write_mem(record.addr, &record.data);
        }
    }

    /// Try to execute `step`, adjusting for `req` if needed. Returns 0 if
    /// `step` was made, or nonzero if there was a trap or `step` needs more
    /// work.
    pub(crate) fn try_one_trace_step(
        &mut self,
        t: &mut dyn Task,
        step: &TraceStep,
        req: &DbgRequest,
    ) -> i32 {
        let stepi = matches!(req, DbgRequest::ResumeStep(target) if *target == t.rec_tid());
        match step.action {
            TraceStepAction::Retire => 0,
            TraceStepAction::EnterSyscall => self.enter_syscall(t, step, stepi),
            TraceStepAction::ExitSyscall => self.exit_syscall(t, step, stepi),
        }
    }

    /// Dump or verify tracee memory as the flags demand.
    fn debug_memory(&mut self, t: &mut dyn Task) {
        let frame_time = t.frame().global_time;
        let stop_reason = t.frame().stop_reason;
        let state = t.frame().state;

        let dump_requested = match Flags::get().dump_on {
            Some(DumpOn::DumpOnAll) => true,
            Some(DumpOn::DumpOnSyscall(no)) => stop_reason == no,
            Some(DumpOn::DumpOnSignal(sig)) => stop_reason == -sig,
            None => false,
        } || Flags::get().dump_at == Some(frame_time);
        if dump_requested {
            let tag = format!("{}_{}_rep", t.rec_tid(), frame_time);
            self.memory_checker.dump_process_memory(t, &tag);
        }

        if self.validate {
            let check = match Flags::get().checksum {
                Some(Checksum::ChecksumAll) => true,
                Some(Checksum::ChecksumSyscall) => state == SyscallState::Exit,
                Some(Checksum::ChecksumAt(from_time)) => from_time <= frame_time,
                None => false,
            };
            if check {
                self.memory_checker.validate_process_memory(t);
            }
        }
    }

    pub(crate) fn notify_stop(&mut self, thread: DbgThreadId, sig: i32, watch_addr: RemotePtr<u8>) {
        if let Some(dbg) = self.dbg.as_mut() {
            dbg.notify_stop(thread, sig, watch_addr);
        }
    }

    /// The tracee is in a state replay cannot continue from. Serve a
    /// debugger on a port derived from the task's pid so a human can
    /// inspect the wreckage, then die.
    pub(crate) fn emergency_debug(&mut self, t: &mut dyn Task) -> ! {
        log!(LogError, "Entering emergency debug for task {}", t.tid());
        self.dbg = Some(self.dbg_server.await_client_connection(t.tid()));
        self.process_debugger_requests(t);
        fatal!("Can't resume execution from invalid state");
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::DbgRegister;
    use crate::test_support::{
        build_controller, controller_with_dbg, frame, stop_status, syscall_stop_status, MockTask,
        MockTraceReader,
    };
    use crate::trace::{RawDataRecord, SyscallStep};
    use std::rc::Rc;

    #[test]
    fn breakpoint_set_writes_trap_byte() {
        let mut table = BreakpointTable::new();
        let mut t = MockTask::new(100, 100);
        let addr = RemotePtr::new_from_val(0x400500);
        t.poke_mem(addr, &[0x55]);

        table.set(&mut t, addr);
        assert_eq!(vec![BREAKPOINT_INSN], t.peek_mem(addr, 1));
        assert!(table.is_set(addr));
    }

    #[test]
    fn breakpoint_remove_restores_original_byte() {
        let mut table = BreakpointTable::new();
        let mut t = MockTask::new(100, 100);
        let addr = RemotePtr::new_from_val(0x400500);
        t.poke_mem(addr, &[0x55]);

        table.set(&mut t, addr);
        table.remove(&mut t, addr);
        assert_eq!(vec![0x55], t.peek_mem(addr, 1));
        assert!(!table.is_set(addr));
    }

    #[test]
    fn removing_unknown_breakpoint_is_harmless() {
        let mut table = BreakpointTable::new();
        let mut t = MockTask::new(100, 100);
        table.remove(&mut t, RemotePtr::new_from_val(0x1234));
    }

    #[test]
    fn eip_is_breakpoint_looks_one_byte_back() {
        let mut table = BreakpointTable::new();
        let mut t = MockTask::new(100, 100);
        let addr = RemotePtr::new_from_val(0x400500);
        t.poke_mem(addr, &[0x90]);

        table.set(&mut t, addr);
        assert!(table.eip_is_breakpoint(RemotePtr::new_from_val(0x400501)));
        assert!(!table.eip_is_breakpoint(addr));
        assert!(!table.eip_is_breakpoint(RemotePtr::null()));
    }

    #[test]
    fn autopilot_replay_runs_all_threads_to_exit() {
        let mut reader = MockTraceReader::default();
        reader
            .frames
            .push_back(frame(1, 100, -libc::SIGUSR1, SyscallState::Entry));
        reader
            .frames
            .push_back(frame(2, 100, USR_FLUSH, SyscallState::Entry));
        reader
            .frames
            .push_back(frame(3, 100, USR_EXIT, SyscallState::Entry));
        let (mut controller, dbg_record, collab) = build_controller(reader, None);

        let t = MockTask::new(100, 100);
        let events = Rc::clone(&t.events);
        controller.scheduler.register_thread(Box::new(t));

        controller.replay_loop();

        assert_eq!(0, controller.scheduler.num_threads());
        let rec = collab.borrow();
        assert_eq!(vec![libc::SIGUSR1], rec.signals);
        assert_eq!(1, rec.flushes);
        // The signal frame re-arms the ticks counter; the buffered flush
        // leaves it alone.
        assert_eq!(vec![0], events.borrow().hpc_resets);
        assert_eq!(1, events.borrow().hpc_stops);
        // No debugger was ever contacted.
        assert!(dbg_record.borrow().stops.is_empty());
        assert!(dbg_record.borrow().exit_codes.is_empty());
    }

    #[test]
    fn scratch_init_reserves_recorded_range() {
        let mut reader = MockTraceReader::default();
        let mut scratch_frame = frame(1, 100, USR_INIT_SCRATCH_MEM, SyscallState::Entry);
        scratch_frame.recorded_regs.set_syscall_result(0x7000_0000);
        reader.frames.push_back(scratch_frame);
        reader.frames.push_back(frame(2, 100, USR_EXIT, SyscallState::Entry));
        reader.mmapped_files.push_back(MmappedFile {
            start: RemotePtr::new_from_val(0x7000_0000),
            end: RemotePtr::new_from_val(0x7000_2000),
        });
        let (mut controller, _dbg_record, collab) = build_controller(reader, None);

        let t = MockTask::new(100, 100);
        let events = Rc::clone(&t.events);
        controller.scheduler.register_thread(Box::new(t));

        controller.replay_loop();

        assert_eq!(vec![(0x7000_0000, 0x2000)], collab.borrow().scratch);
        assert_eq!(vec![libc::SYS_mmap], events.borrow().injected_syscalls);
    }

    #[test]
    fn execve_exit_frame_turns_on_validation() {
        let mut reader = MockTraceReader::default();
        reader.frames.push_back(frame(
            1,
            100,
            libc::SYS_execve as i32,
            SyscallState::Exit,
        ));
        reader.frames.push_back(frame(2, 100, USR_EXIT, SyscallState::Entry));
        let (mut controller, _dbg_record, collab) = build_controller(reader, None);
        controller.scheduler.register_thread(Box::new(MockTask::new(100, 100)));

        assert!(!controller.validate);
        controller.replay_loop();

        assert!(controller.validate);
        assert_eq!(vec![libc::SYS_execve as i32], collab.borrow().syscalls);
    }

    #[test]
    fn debugger_requests_serviced_until_resume() {
        let addr = RemotePtr::new_from_val(0x400500);
        let (mut controller, record) = controller_with_dbg(vec![
            DbgRequest::GetCurrentThread,
            DbgRequest::GetMem(addr, 2),
            DbgRequest::GetOffsets,
            DbgRequest::GetReg(100, DbgRegister::Rip),
            DbgRequest::GetRegs(100),
            DbgRequest::GetStopReason(100),
            DbgRequest::GetThreadList,
            DbgRequest::SetSwBreak(addr, 1),
            DbgRequest::SetHwBreak(addr, 1),
            DbgRequest::RemoveSwBreak(addr, 1),
            DbgRequest::ResumeStep(100),
        ]);
        let mut t = MockTask::new(100, 100);
        t.poke_mem(addr, &[0xAB, 0xCD]);
        t.regs.set_ip(RemotePtr::new_from_val(0x400500));

        let req = controller.process_debugger_requests(&mut t);

        assert_eq!(DbgRequest::ResumeStep(100), req);
        let rec = record.borrow();
        assert_eq!(vec![100], rec.current_thread_replies);
        assert_eq!(vec![vec![0xAB, 0xCD]], rec.mem_replies);
        assert_eq!(1, rec.offsets_replies);
        assert_eq!(vec![(DbgRegister::Rip, 0x400500)], rec.reg_replies);
        assert_eq!(vec![crate::registers::DBG_REGISTER_FILE.len()], rec.regfile_reply_lens);
        assert_eq!(vec![(100, 0)], rec.stop_reason_replies);
        assert_eq!(vec![vec![100]], rec.thread_list_replies);
        // sw break set, hw break unsupported, sw break removed
        assert_eq!(vec![0, -1, 0], rec.watchpoint_replies);
        // The removed breakpoint restored the original byte.
        assert_eq!(vec![0xAB], t.peek_mem(addr, 1));
        assert!(!controller.breakpoints.is_set(addr));
    }

    #[test]
    fn trap_at_breakpoint_notifies_debugger_and_retries() {
        let addr = RemotePtr::new_from_val(0x400500);
        let (mut controller, record, collab) = build_controller(
            MockTraceReader::default(),
            Some(vec![DbgRequest::ResumeContinue]),
        );
        collab.borrow_mut().steps.push_back(TraceStep {
            action: TraceStepAction::EnterSyscall,
            syscall: SyscallStep {
                no: 1,
                emu: false,
                num_emu_args: 0,
                emu_ret: false,
            },
        });

        let mut t = MockTask::new(100, 100);
        t.frame = frame(5, 100, 1, SyscallState::Entry);
        t.poke_mem(addr, &[0x90]);
        controller.breakpoints.set(&mut t, addr);
        t.regs.set_ip(RemotePtr::new_from_val(0x400501));
        t.wait_script = vec![stop_status(libc::SIGTRAP), syscall_stop_status()].into();
        let events = Rc::clone(&t.events);

        let keep = controller.replay_one_trace_frame(&mut t);

        assert!(keep);
        assert_eq!(vec![(100, libc::SIGTRAP, 0)], record.borrow().stops);
        use crate::task::ResumeRequest::ResumeSyscall;
        assert_eq!(vec![ResumeSyscall, ResumeSyscall], events.borrow().resumes);
        assert_eq!(vec![0], events.borrow().hpc_resets);
    }

    #[test]
    fn emulated_syscall_exit_pushes_data_and_return_value() {
        let mut reader = MockTraceReader::default();
        reader.raw_data.push_back(RawDataRecord {
            addr: RemotePtr::new_from_val(0x1000),
            data: vec![1, 2, 3],
        });
        let (mut controller, _record, _collab) = build_controller(reader, None);

        let mut t = MockTask::new(100, 100);
        let mut syscall_frame = frame(7, 100, 0, SyscallState::Exit);
        syscall_frame.recorded_regs.set_syscall_result(42);
        t.frame = syscall_frame;

        let step = TraceStep {
            action: TraceStepAction::ExitSyscall,
            syscall: SyscallStep {
                no: 0,
                emu: true,
                num_emu_args: 1,
                emu_ret: true,
            },
        };
        let ret = controller.try_one_trace_step(&mut t, &step, &DbgRequest::ResumeContinue);

        assert_eq!(0, ret);
        assert_eq!(vec![1, 2, 3], t.peek_mem(RemotePtr::new_from_val(0x1000), 3));
        assert_eq!(42, t.regs.syscall_result());
        assert_eq!(1, t.events.borrow().finished_emulated);
        // The virtual exit never resumes through a syscall boundary.
        assert!(t.events.borrow().resumes.is_empty());
    }

    #[test]
    fn sigchld_during_stepping_is_swallowed() {
        let (mut controller, _record, _collab) =
            build_controller(MockTraceReader::default(), None);

        let mut t = MockTask::new(100, 100);
        t.frame = frame(9, 100, 0, SyscallState::Entry);
        t.wait_script = vec![stop_status(libc::SIGCHLD), syscall_stop_status()].into();

        let step = TraceStep {
            action: TraceStepAction::EnterSyscall,
            syscall: SyscallStep::default(),
        };
        let ret = controller.try_one_trace_step(&mut t, &step, &DbgRequest::ResumeContinue);

        assert_eq!(0, ret);
        assert_eq!(0, t.pending_sig());
        use crate::task::ResumeRequest::ResumeSyscall;
        assert_eq!(vec![ResumeSyscall, ResumeSyscall], t.events.borrow().resumes);
    }

    #[test]
    fn breakpoints_can_be_reused_after_removal() {
        let mut table = BreakpointTable::new();
        let mut t = MockTask::new(100, 100);
        for i in 0..MAX_NUM_BREAKPOINTS {
            let addr = RemotePtr::new_from_val(0x400000 + i * 16);
            t.poke_mem(addr, &[i as u8]);
            table.set(&mut t, addr);
        }
        let first = RemotePtr::new_from_val(0x400000);
        table.remove(&mut t, first);

        let fresh = RemotePtr::new_from_val(0x500000);
        t.poke_mem(fresh, &[0xAA]);
        table.set(&mut t, fresh);
        assert!(table.is_set(fresh));
        assert_eq!(vec![BREAKPOINT_INSN], t.peek_mem(fresh, 1));
    }
}
