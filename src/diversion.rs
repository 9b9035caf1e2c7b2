//! Diversion sessions.
//!
//! A diversion lets the debugger run tracee code without disturbing
//! replay: the replay tasks are forked into a mutable sibling session,
//! execution happens there, and the forks are killed when the debugger
//! lets go. Diversions emulate the syscalls they must (the namespaced-id
//! family that could shoot down live processes) and execute the rest for
//! real; tracees can easily get into inconsistent states within a
//! diversion, and no attempt is made to detect or rectify that. The mode
//! exists to support short-lived excursions such as gdb's `call foo()`.

use crate::dbg_connection::DbgRequest;
use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::replayer::{BreakpointTable, ReplayController};
use crate::task::{ResumeRequest, Task};
use libc::pid_t;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunCommand {
    RunContinue,
    RunSinglestep,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DiversionStatus {
    /// Some execution was done. diversion_step() can be called again.
    DiversionContinue,
    /// All tracees are dead. diversion_step() should not be called again.
    DiversionExited,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakReason {
    BreakNone,
    /// A signal was delivered to the task.
    BreakSignal,
    /// The task hit a software breakpoint.
    BreakBreakpoint,
    /// A requested single step completed.
    BreakSinglestep,
    /// A watchpoint fired (never produced here; hardware watchpoints are
    /// unsupported).
    BreakWatchpoint,
}

#[derive(Copy, Clone, Debug)]
pub struct BreakStatus {
    pub reason: BreakReason,
    pub signal: i32,
    pub watch_address: RemotePtr<u8>,
}

impl Default for BreakStatus {
    fn default() -> Self {
        BreakStatus {
            reason: BreakReason::BreakNone,
            signal: 0,
            watch_address: RemotePtr::null(),
        }
    }
}

impl Default for DiversionStatus {
    fn default() -> Self {
        DiversionStatus::DiversionContinue
    }
}

#[derive(Default)]
pub struct DiversionResult {
    pub status: DiversionStatus,
    pub break_status: BreakStatus,
}

/// A mutable fork of the replay session plus the number of debugger
/// references keeping it alive. When `refcount` reaches 0 the diversion is
/// dying and ends at the next resume-class request.
pub struct DiversionSession {
    tasks: BTreeMap<pid_t, Box<dyn Task>>,
    /// The rec tid execution requests are aimed at.
    current: pid_t,
    pub refcount: usize,
}

impl DiversionSession {
    pub fn new(current: pid_t) -> DiversionSession {
        DiversionSession {
            tasks: BTreeMap::new(),
            current,
            refcount: 1,
        }
    }

    pub fn add_task(&mut self, t: Box<dyn Task>) {
        self.tasks.insert(t.rec_tid(), t);
    }

    pub fn current_tid(&self) -> pid_t {
        self.current
    }

    pub fn current_task_mut(&mut self) -> Option<&mut (dyn Task + 'static)> {
        let current = self.current;
        self.tasks.get_mut(&current).map(|t| &mut **t)
    }

    /// Try to make progress in this diversion session.
    pub fn diversion_step(
        &mut self,
        command: RunCommand,
        breakpoints: &BreakpointTable,
    ) -> DiversionResult {
        let mut result = DiversionResult::default();
        let t = match self.current_task_mut() {
            Some(t) => t,
            None => {
                result.status = DiversionStatus::DiversionExited;
                return result;
            }
        };

        match command {
            RunCommand::RunContinue => {
                log!(LogDebug, "Continuing to next syscall");
                t.resume_execution(ResumeRequest::ResumeSysemu, 0);
            }
            RunCommand::RunSinglestep => {
                log!(LogDebug, "Stepping to next insn/syscall");
                t.resume_execution(ResumeRequest::ResumeSysemuSinglestep, 0);
            }
        }
        let status = t.wait();

        if status.exit_code().is_some()
            || status.fatal_sig().is_some()
            || status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT)
        {
            result.status = DiversionStatus::DiversionExited;
            return result;
        }

        result.status = DiversionStatus::DiversionContinue;
        if t.pending_sig() != 0 {
            result.break_status = diagnose_debugger_trap(t, command, breakpoints);
            log!(
                LogDebug,
                "Diversion break at ip={}; reason={:?}",
                t.regs().ip(),
                result.break_status.reason
            );
            return result;
        }

        // A syscall boundary was reached under SYSEMU.
        let regs = t.regs();
        let sys_no = regs.original_syscallno() as i32;
        process_syscall(t, sys_no, &regs);
        result
    }

    pub fn kill_all_tasks(&mut self) {
        for (_, t) in self.tasks.iter_mut() {
            t.kill();
        }
        self.tasks.clear();
    }
}

/// Work out why a stopped diversion task stopped.
fn diagnose_debugger_trap(
    t: &mut dyn Task,
    command: RunCommand,
    breakpoints: &BreakpointTable,
) -> BreakStatus {
    let mut break_status = BreakStatus::default();
    let sig = t.pending_sig();
    if sig == libc::SIGTRAP {
        let ip = t.regs().ip();
        if breakpoints.eip_is_breakpoint(ip) {
            break_status.reason = BreakReason::BreakBreakpoint;
        } else if command == RunCommand::RunSinglestep {
            break_status.reason = BreakReason::BreakSinglestep;
        } else {
            break_status.reason = BreakReason::BreakSignal;
            break_status.signal = sig;
        }
    } else {
        break_status.reason = BreakReason::BreakSignal;
        break_status.signal = sig;
    }

    break_status
}

/// Emulate or execute the syscall a diversion task arrived at. The
/// namespaced-id family is suppressed: during replay those ids may refer
/// to different, live resources, and a diversion tracee must not go
/// shooting down other processes. Filesystem and other side effects are
/// optimistically assumed to be intended by the user.
fn process_syscall(t: &mut dyn Task, sys_no: i32, regs: &Registers) {
    if sys_no == libc::SYS_kill as i32
        || sys_no == libc::SYS_tgkill as i32
        || sys_no == libc::SYS_tkill as i32
        || sys_no == libc::SYS_rt_sigqueueinfo as i32
        || sys_no == libc::SYS_rt_tgsigqueueinfo as i32
    {
        log!(LogDebug, "Suppressing syscall {}", sys_no);
        return;
    }

    log!(LogDebug, "Executing syscall {}", sys_no);
    let mut call = *regs;
    call.set_syscallno(sys_no as i64);
    let result_regs = t.inject_and_execute_syscall(&call);

    let mut final_regs = t.regs();
    final_regs.set_syscall_result(result_regs.syscall_result());
    t.set_regs(&final_regs);
}

impl ReplayController {
    /// Create a new diversion session using the replay session as the
    /// template; the replay tasks aren't mutated. Execution happens in the
    /// diversion under debugger control until the debugger releases its
    /// references; the first request that belongs to the underlying replay
    /// is returned (None when the diversion consumed everything).
    pub(crate) fn divert(&mut self, t: &mut dyn Task) -> Option<DbgRequest> {
        log!(
            LogDebug,
            "Starting debugging diversion for task {}",
            t.rec_tid()
        );
        debug_assert!(self.diversion.is_none());

        self.diversion = Some(self.clone_diversion(t));

        let mut carried_req: Option<DbgRequest> = None;
        let mut req = DbgRequest::ResumeContinue;
        loop {
            if !self.diverter_process_debugger_requests(&mut req) {
                if req.is_breakpoint_request() {
                    // A breakpoint request aimed at the dying diversion is
                    // really a command for the replay session.
                    carried_req = Some(req.clone());
                }
                break;
            }
            debug_assert!(req.is_resume_request());

            let current_tid = self.diversion.as_ref().unwrap().current_tid();
            let command = match req {
                DbgRequest::ResumeStep(target) if target == current_tid => {
                    RunCommand::RunSinglestep
                }
                _ => RunCommand::RunContinue,
            };

            let mut session = self.diversion.take().unwrap();
            let result = session.diversion_step(command, &self.breakpoints);
            self.diversion = Some(session);

            if result.status == DiversionStatus::DiversionExited {
                self.diversion.as_mut().unwrap().refcount = 0;
                if let Some(dbg) = self.dbg.as_mut() {
                    dbg.notify_exit_code(0);
                }
                break;
            }

            debug_assert_eq!(DiversionStatus::DiversionContinue, result.status);
            match result.break_status.reason {
                BreakReason::BreakNone => continue,
                BreakReason::BreakSignal => {
                    self.notify_stop(current_tid, result.break_status.signal, RemotePtr::null());
                }
                BreakReason::BreakWatchpoint => {
                    self.notify_stop(
                        current_tid,
                        libc::SIGTRAP,
                        result.break_status.watch_address,
                    );
                }
                BreakReason::BreakBreakpoint | BreakReason::BreakSinglestep => {
                    self.notify_stop(current_tid, libc::SIGTRAP, RemotePtr::null());
                }
            }
        }

        log!(LogDebug, "... ending debugging diversion");
        let mut session = self.diversion.take().unwrap();
        debug_assert_eq!(0, session.refcount);
        session.kill_all_tasks();
        carried_req
    }

    /// Fork every replay task into a fresh diversion session. `t` is the
    /// task currently checked out of the scheduler.
    fn clone_diversion(&mut self, t: &mut dyn Task) -> DiversionSession {
        let mut session = DiversionSession::new(t.rec_tid());
        session.add_task(t.fork_diversion());
        for rec_tid in self.scheduler.thread_list() {
            if let Some(other) = self.scheduler.find_task_mut(rec_tid) {
                session.add_task(other.fork_diversion());
            }
        }
        session
    }

    /// Process debugger requests made against the diversion session until
    /// action needs to be taken by the caller (a resume-execution request
    /// is received with live references). Returns false when the diversion
    /// must end.
    fn diverter_process_debugger_requests(&mut self, req: &mut DbgRequest) -> bool {
        loop {
            *req = match self.dbg.as_mut() {
                Some(dbg) => dbg.get_request(),
                None => return false,
            };

            if req.is_resume_request() {
                return self.diversion.as_ref().unwrap().refcount > 0;
            }

            match &*req {
                DbgRequest::Restart => {
                    // Restart is an immediate exit from the diversion.
                    self.diversion.as_mut().unwrap().refcount = 0;
                    return false;
                }
                DbgRequest::ReadSigInfo(len) => {
                    log!(LogDebug, "Adding ref to diversion session");
                    self.diversion.as_mut().unwrap().refcount += 1;
                    let si_bytes = vec![0u8; *len];
                    self.dbg.as_mut().unwrap().reply_read_siginfo(&si_bytes);
                    continue;
                }
                DbgRequest::WriteSigInfo(_) => {
                    log!(LogDebug, "Removing reference to diversion session ...");
                    let session = self.diversion.as_mut().unwrap();
                    debug_assert!(session.refcount > 0);
                    session.refcount -= 1;
                    if session.refcount == 0 {
                        log!(LogDebug, "  ... dying at next continue request");
                    }
                    self.dbg.as_mut().unwrap().reply_write_siginfo();
                    continue;
                }
                other if other.is_breakpoint_request() => {
                    // Setting breakpoints in a dying diversion is assumed
                    // to be a user action intended for the replay session,
                    // so return to it now.
                    if self.diversion.as_ref().unwrap().refcount == 0 {
                        return false;
                    }
                }
                _ => (),
            }

            let mut session = self.diversion.take().unwrap();
            match session.current_task_mut() {
                Some(task) => {
                    let request = req.clone();
                    self.dispatch_debugger_request(task, &request);
                }
                None => {
                    session.refcount = 0;
                    self.diversion = Some(session);
                    return false;
                }
            }
            self.diversion = Some(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        controller_with_dbg, MockTask,
    };

    fn diversion_ready_task() -> MockTask {
        // The initial task; its fork script drives the diversion tasks.
        MockTask::new(500, 500)
    }

    #[test]
    fn refcount_round_trip_and_teardown() {
        // READ_SIGINFO^2 ; WRITE_SIGINFO^2 brings the refcount back to its
        // initial value; the next continue after the final WRITE_SIGINFO
        // ends the diversion.
        let (mut controller, record) = controller_with_dbg(vec![
            DbgRequest::ReadSigInfo(128),
            DbgRequest::WriteSigInfo(vec![0; 16]),
            DbgRequest::ResumeContinue,
            DbgRequest::WriteSigInfo(vec![0; 16]),
            DbgRequest::ResumeContinue,
        ]);
        let mut t = diversion_ready_task();
        // One diversion step happens (the first ResumeContinue while
        // refcount is still 1); have the fork stop at a syscall-free
        // singlestep-style trap so no syscall processing runs.
        t.fork_wait_script = vec![crate::test_support::stop_status(libc::SIGTRAP)];

        let carried = controller.divert(&mut t);
        assert_eq!(None, carried);
        assert!(controller.diversion.is_none());

        let rec = record.borrow();
        // ReadSigInfo and the in-diversion ReadSigInfo reply zeros.
        assert_eq!(vec![128], rec.siginfo_reads);
        assert_eq!(2, rec.siginfo_writes);
        // The SIGTRAP stop after the first continue was reported.
        assert_eq!(vec![(500, libc::SIGTRAP, 0)], rec.stops);
        // The diversion forks were killed.
        assert_eq!(vec![501], t.events.borrow().kills);
    }

    #[test]
    fn exit_of_diversion_task_notifies_exit_code() {
        let (mut controller, record) = controller_with_dbg(vec![DbgRequest::ResumeContinue]);
        let mut t = diversion_ready_task();
        t.fork_wait_script = vec![crate::test_support::exit_status(0)];

        let carried = controller.divert(&mut t);
        assert_eq!(None, carried);
        assert!(controller.diversion.is_none());
        assert_eq!(vec![0], record.borrow().exit_codes);
    }

    #[test]
    fn breakpoint_request_in_dying_diversion_is_carried_to_replay() {
        let addr = RemotePtr::new_from_val(0x400500);
        let (mut controller, _record) = controller_with_dbg(vec![
            DbgRequest::WriteSigInfo(vec![0; 16]),
            DbgRequest::SetSwBreak(addr, 1),
        ]);
        let mut t = diversion_ready_task();

        let carried = controller.divert(&mut t);
        assert_eq!(Some(DbgRequest::SetSwBreak(addr, 1)), carried);
        assert!(controller.diversion.is_none());
    }

    #[test]
    fn restart_ends_diversion_immediately() {
        let (mut controller, _record) = controller_with_dbg(vec![DbgRequest::Restart]);
        let mut t = diversion_ready_task();

        let carried = controller.divert(&mut t);
        assert_eq!(None, carried);
        assert!(controller.diversion.is_none());
    }

    #[test]
    fn queries_are_serviced_against_the_diversion() {
        let (mut controller, record) = controller_with_dbg(vec![
            DbgRequest::GetCurrentThread,
            DbgRequest::WriteSigInfo(vec![0; 16]),
            DbgRequest::ResumeContinue,
        ]);
        let mut t = diversion_ready_task();

        let carried = controller.divert(&mut t);
        assert_eq!(None, carried);
        let rec = record.borrow();
        assert_eq!(vec![500], rec.current_thread_replies);
    }
}
