//! Scripted collaborators for driving the replay and diversion engines in
//! unit tests.

use crate::dbg_connection::{DbgConnection, DbgRequest, DbgThreadId};
use crate::registers::{DbgRegValue, DbgRegister, Registers};
use crate::remote_ptr::RemotePtr;
use crate::replayer::{MemoryChecker, ReplayController, SignalReplayer, SyscallReplayer};
use crate::scheduler::Scheduler;
use crate::task::{ResumeRequest, Task};
use crate::ticks::Ticks;
use crate::trace::{
    MmappedFile, RawDataRecord, SyscallState, TraceFrame, TraceReader, TraceStep,
};
use crate::wait_status::WaitStatus;
use libc::pid_t;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

pub fn stop_status(sig: i32) -> WaitStatus {
    WaitStatus::new((sig << 8) | 0x7f)
}

pub fn syscall_stop_status() -> WaitStatus {
    WaitStatus::new(((libc::SIGTRAP | 0x80) << 8) | 0x7f)
}

pub fn exit_status(code: i32) -> WaitStatus {
    WaitStatus::new((code & 0xff) << 8)
}

pub fn frame(global_time: u64, tid: pid_t, stop_reason: i32, state: SyscallState) -> TraceFrame {
    TraceFrame {
        global_time,
        tid,
        stop_reason,
        state,
        recorded_regs: Registers::new(),
    }
}

/// Everything a MockTask (and its diversion forks) did, shared so tests
/// can look after the task has been consumed by the scheduler.
#[derive(Default)]
pub struct TaskEvents {
    pub resumes: Vec<ResumeRequest>,
    pub hpc_resets: Vec<Ticks>,
    pub hpc_stops: usize,
    pub injected_syscalls: Vec<i64>,
    pub finished_emulated: usize,
    pub kills: Vec<pid_t>,
}

pub struct MockTask {
    pub tid: pid_t,
    pub rec_tid: pid_t,
    pub frame: TraceFrame,
    pub pending_sig: i32,
    pub status: WaitStatus,
    pub regs: Registers,
    pub mem: HashMap<usize, u8>,
    pub wait_script: VecDeque<WaitStatus>,
    /// The wait script handed to tasks forked for a diversion.
    pub fork_wait_script: Vec<WaitStatus>,
    pub ticks: Ticks,
    pub events: Rc<RefCell<TaskEvents>>,
}

impl MockTask {
    pub fn new(tid: pid_t, rec_tid: pid_t) -> MockTask {
        MockTask {
            tid,
            rec_tid,
            frame: TraceFrame::default(),
            pending_sig: 0,
            status: WaitStatus::default(),
            regs: Registers::new(),
            mem: HashMap::new(),
            wait_script: VecDeque::new(),
            fork_wait_script: Vec::new(),
            ticks: 0,
            events: Rc::new(RefCell::new(TaskEvents::default())),
        }
    }

    pub fn poke_mem(&mut self, addr: RemotePtr<u8>, bytes: &[u8]) {
        self.write_mem(addr, bytes);
    }

    pub fn peek_mem(&mut self, addr: RemotePtr<u8>, len: usize) -> Vec<u8> {
        self.read_mem(addr, len)
    }
}

impl Task for MockTask {
    fn tid(&self) -> pid_t {
        self.tid
    }

    fn rec_tid(&self) -> pid_t {
        self.rec_tid
    }

    fn frame(&self) -> &TraceFrame {
        &self.frame
    }

    fn set_frame(&mut self, frame: TraceFrame) {
        self.frame = frame;
    }

    fn pending_sig(&self) -> i32 {
        self.pending_sig
    }

    fn set_pending_sig(&mut self, sig: i32) {
        self.pending_sig = sig;
    }

    fn status(&self) -> WaitStatus {
        self.status
    }

    fn regs(&mut self) -> Registers {
        self.regs
    }

    fn set_regs(&mut self, regs: &Registers) {
        self.regs = *regs;
    }

    fn read_mem(&mut self, addr: RemotePtr<u8>, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.mem.get(&(addr.as_uint() + i)).unwrap_or(&0))
            .collect()
    }

    fn write_mem(&mut self, addr: RemotePtr<u8>, buf: &[u8]) {
        for (i, byte) in buf.iter().enumerate() {
            self.mem.insert(addr.as_uint() + i, *byte);
        }
    }

    fn resume_execution(&mut self, how: ResumeRequest, _sig: i32) {
        self.events.borrow_mut().resumes.push(how);
    }

    fn wait(&mut self) -> WaitStatus {
        self.status = self
            .wait_script
            .pop_front()
            .unwrap_or_else(|| panic!("wait script exhausted for task {}", self.tid));
        self.pending_sig = self.status.pending_signal();
        self.status
    }

    fn inject_and_execute_syscall(&mut self, callregs: &Registers) -> Registers {
        self.events
            .borrow_mut()
            .injected_syscalls
            .push(callregs.syscallno());
        Registers::new()
    }

    fn finish_emulated_syscall(&mut self) {
        self.events.borrow_mut().finished_emulated += 1;
    }

    fn reset_hpc(&mut self, period: Ticks) {
        self.events.borrow_mut().hpc_resets.push(period);
    }

    fn read_ticks(&mut self) -> Ticks {
        self.ticks
    }

    fn stop_hpc(&mut self) {
        self.events.borrow_mut().hpc_stops += 1;
    }

    fn fork_diversion(&mut self) -> Box<dyn Task> {
        let mut child = MockTask::new(self.tid + 1, self.rec_tid);
        child.wait_script = self.fork_wait_script.clone().into();
        child.mem = self.mem.clone();
        child.regs = self.regs;
        child.events = Rc::clone(&self.events);
        Box::new(child)
    }

    fn kill(&mut self) {
        self.events.borrow_mut().kills.push(self.tid);
    }
}

/// Everything the scripted debugger connection saw.
#[derive(Default)]
pub struct DbgRecord {
    pub requests: VecDeque<DbgRequest>,
    pub current_thread_replies: Vec<DbgThreadId>,
    pub thread_alive_replies: Vec<bool>,
    pub mem_replies: Vec<Vec<u8>>,
    pub offsets_replies: usize,
    pub reg_replies: Vec<(DbgRegister, u64)>,
    pub regfile_reply_lens: Vec<usize>,
    pub stop_reason_replies: Vec<(DbgThreadId, i32)>,
    pub thread_list_replies: Vec<Vec<DbgThreadId>>,
    pub watchpoint_replies: Vec<i32>,
    pub siginfo_reads: Vec<usize>,
    pub siginfo_writes: usize,
    pub stops: Vec<(DbgThreadId, i32, usize)>,
    pub exit_codes: Vec<i32>,
}

pub struct MockDbgConnection {
    pub record: Rc<RefCell<DbgRecord>>,
}

impl DbgConnection for MockDbgConnection {
    fn get_request(&mut self) -> DbgRequest {
        self.record
            .borrow_mut()
            .requests
            .pop_front()
            .expect("debugger request script exhausted")
    }

    fn reply_get_current_thread(&mut self, thread: DbgThreadId) {
        self.record.borrow_mut().current_thread_replies.push(thread);
    }

    fn reply_get_is_thread_alive(&mut self, alive: bool) {
        self.record.borrow_mut().thread_alive_replies.push(alive);
    }

    fn reply_get_mem(&mut self, mem: &[u8]) {
        self.record.borrow_mut().mem_replies.push(mem.to_vec());
    }

    fn reply_get_offsets(&mut self) {
        self.record.borrow_mut().offsets_replies += 1;
    }

    fn reply_get_reg(&mut self, value: DbgRegValue) {
        self.record
            .borrow_mut()
            .reg_replies
            .push((value.reg, value.value));
    }

    fn reply_get_regs(&mut self, file: &[DbgRegValue]) {
        self.record.borrow_mut().regfile_reply_lens.push(file.len());
    }

    fn reply_get_stop_reason(&mut self, which: DbgThreadId, sig: i32) {
        self.record.borrow_mut().stop_reason_replies.push((which, sig));
    }

    fn reply_get_thread_list(&mut self, threads: &[DbgThreadId]) {
        self.record
            .borrow_mut()
            .thread_list_replies
            .push(threads.to_vec());
    }

    fn reply_watchpoint_request(&mut self, status: i32) {
        self.record.borrow_mut().watchpoint_replies.push(status);
    }

    fn reply_read_siginfo(&mut self, si_bytes: &[u8]) {
        self.record.borrow_mut().siginfo_reads.push(si_bytes.len());
    }

    fn reply_write_siginfo(&mut self) {
        self.record.borrow_mut().siginfo_writes += 1;
    }

    fn notify_stop(&mut self, thread: DbgThreadId, sig: i32, watch_addr: RemotePtr<u8>) {
        self.record
            .borrow_mut()
            .stops
            .push((thread, sig, watch_addr.as_uint()));
    }

    fn notify_exit_code(&mut self, code: i32) {
        self.record.borrow_mut().exit_codes.push(code);
    }
}

#[derive(Default)]
pub struct MockTraceReader {
    pub frames: VecDeque<TraceFrame>,
    pub mmapped_files: VecDeque<MmappedFile>,
    pub raw_data: VecDeque<RawDataRecord>,
}

impl TraceReader for MockTraceReader {
    fn next_frame(&mut self) -> Option<TraceFrame> {
        self.frames.pop_front()
    }

    fn next_mmapped_file(&mut self) -> MmappedFile {
        self.mmapped_files
            .pop_front()
            .expect("mmapped file script exhausted")
    }

    fn next_raw_data(&mut self) -> RawDataRecord {
        self.raw_data.pop_front().unwrap_or_default()
    }
}

/// Everything the scripted replay collaborators were asked to do.
#[derive(Default)]
pub struct CollabRecord {
    pub syscalls: Vec<i32>,
    /// Steps handed out by `process_syscall`, in order; empty leaves the
    /// default Retire step.
    pub steps: VecDeque<TraceStep>,
    pub flushes: usize,
    pub signals: Vec<i32>,
    pub dumps: Vec<String>,
    pub validations: usize,
    pub scratch: Vec<(usize, usize)>,
}

pub struct ScriptedSyscallReplayer {
    pub record: Rc<RefCell<CollabRecord>>,
}

impl SyscallReplayer for ScriptedSyscallReplayer {
    fn process_syscall(&mut self, t: &mut dyn Task, _redirect: bool, step: &mut TraceStep) {
        let mut record = self.record.borrow_mut();
        record.syscalls.push(t.frame().stop_reason);
        if let Some(scripted) = record.steps.pop_front() {
            *step = scripted;
        }
    }

    fn process_flush(&mut self, _t: &mut dyn Task) {
        self.record.borrow_mut().flushes += 1;
    }
}

pub struct ScriptedSignalReplayer {
    pub record: Rc<RefCell<CollabRecord>>,
}

impl SignalReplayer for ScriptedSignalReplayer {
    fn process_signal(&mut self, t: &mut dyn Task, _validate: bool) {
        self.record.borrow_mut().signals.push(-t.frame().stop_reason);
    }
}

pub struct RecordingMemoryChecker {
    pub record: Rc<RefCell<CollabRecord>>,
}

impl MemoryChecker for RecordingMemoryChecker {
    fn dump_process_memory(&mut self, _t: &mut dyn Task, tag: &str) {
        self.record.borrow_mut().dumps.push(tag.to_owned());
    }

    fn validate_process_memory(&mut self, _t: &mut dyn Task) {
        self.record.borrow_mut().validations += 1;
    }

    fn note_scratch_region(&mut self, start: RemotePtr<u8>, num_bytes: usize) {
        self.record
            .borrow_mut()
            .scratch
            .push((start.as_uint(), num_bytes));
    }
}

pub struct PanicDbgServer;

impl crate::dbg_connection::DbgServer for PanicDbgServer {
    fn await_client_connection(
        &mut self,
        _port: i32,
    ) -> Box<dyn crate::dbg_connection::DbgConnection> {
        panic!("tests never open a real debugger server")
    }
}

/// A controller over a scripted trace, optionally with a scripted debugger
/// attached.
pub fn build_controller(
    reader: MockTraceReader,
    requests: Option<Vec<DbgRequest>>,
) -> (
    ReplayController,
    Rc<RefCell<DbgRecord>>,
    Rc<RefCell<CollabRecord>>,
) {
    let dbg_record = Rc::new(RefCell::new(DbgRecord::default()));
    let collab_record = Rc::new(RefCell::new(CollabRecord::default()));

    let scheduler = Scheduler::new(Box::new(reader));
    let mut controller = ReplayController::new(
        scheduler,
        Box::new(PanicDbgServer),
        Box::new(ScriptedSyscallReplayer {
            record: Rc::clone(&collab_record),
        }),
        Box::new(ScriptedSignalReplayer {
            record: Rc::clone(&collab_record),
        }),
        Box::new(RecordingMemoryChecker {
            record: Rc::clone(&collab_record),
        }),
    );

    if let Some(requests) = requests {
        dbg_record.borrow_mut().requests = requests.into();
        controller.dbg = Some(Box::new(MockDbgConnection {
            record: Rc::clone(&dbg_record),
        }));
    }

    (controller, dbg_record, collab_record)
}

/// A controller with an empty trace and a scripted debugger, for driving
/// the request-servicing and diversion loops directly.
pub fn controller_with_dbg(
    requests: Vec<DbgRequest>,
) -> (ReplayController, Rc<RefCell<DbgRecord>>) {
    let (controller, dbg_record, _collab) =
        build_controller(MockTraceReader::default(), Some(requests));
    (controller, dbg_record)
}
