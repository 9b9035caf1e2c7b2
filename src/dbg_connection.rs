use crate::registers::{DbgRegValue, DbgRegister};
use crate::remote_ptr::RemotePtr;
use libc::pid_t;

/// Debugger-visible thread ids are the *recorded* tids, so that a session
/// looks the same to the debugger no matter which pids replay happened to
/// get.
pub type DbgThreadId = pid_t;

/// One decoded debugger request. The wire protocol that produces these
/// lives outside this crate.
#[derive(Clone, Debug, PartialEq)]
pub enum DbgRequest {
    /// Resume all threads.
    ResumeContinue,
    /// Step the given thread by one instruction.
    ResumeStep(DbgThreadId),
    GetCurrentThread,
    GetIsThreadAlive(DbgThreadId),
    GetMem(RemotePtr<u8>, usize),
    GetOffsets,
    GetReg(DbgThreadId, DbgRegister),
    GetRegs(DbgThreadId),
    GetStopReason(DbgThreadId),
    GetThreadList,
    Interrupt,
    Restart,
    SetSwBreak(RemotePtr<u8>, usize),
    RemoveSwBreak(RemotePtr<u8>, usize),
    SetHwBreak(RemotePtr<u8>, usize),
    RemoveHwBreak(RemotePtr<u8>, usize),
    SetRdWatch(RemotePtr<u8>, usize),
    RemoveRdWatch(RemotePtr<u8>, usize),
    SetWrWatch(RemotePtr<u8>, usize),
    RemoveWrWatch(RemotePtr<u8>, usize),
    SetRdWrWatch(RemotePtr<u8>, usize),
    RemoveRdWrWatch(RemotePtr<u8>, usize),
    /// Read the stop siginfo; also marks the start of a diversion.
    ReadSigInfo(usize),
    /// Write the stop siginfo back; drops one diversion reference.
    WriteSigInfo(Vec<u8>),
}

impl DbgRequest {
    /// Resume-class requests end a debugger-servicing loop and hand control
    /// back to the execution engine.
    pub fn is_resume_request(&self) -> bool {
        matches!(self, DbgRequest::ResumeContinue | DbgRequest::ResumeStep(_))
    }

    /// Breakpoint and watchpoint requests, which have special meaning for a
    /// dying diversion.
    pub fn is_breakpoint_request(&self) -> bool {
        matches!(
            self,
            DbgRequest::SetSwBreak(..)
                | DbgRequest::RemoveSwBreak(..)
                | DbgRequest::SetHwBreak(..)
                | DbgRequest::RemoveHwBreak(..)
                | DbgRequest::SetRdWatch(..)
                | DbgRequest::RemoveRdWatch(..)
                | DbgRequest::SetWrWatch(..)
                | DbgRequest::RemoveWrWatch(..)
                | DbgRequest::SetRdWrWatch(..)
                | DbgRequest::RemoveRdWrWatch(..)
        )
    }
}

/// One debugger client connection, already past any protocol handshake.
/// `get_request` blocks until the client sends something.
pub trait DbgConnection {
    fn get_request(&mut self) -> DbgRequest;

    fn reply_get_current_thread(&mut self, thread: DbgThreadId);
    fn reply_get_is_thread_alive(&mut self, alive: bool);
    fn reply_get_mem(&mut self, mem: &[u8]);
    fn reply_get_offsets(&mut self);
    fn reply_get_reg(&mut self, value: DbgRegValue);
    fn reply_get_regs(&mut self, file: &[DbgRegValue]);
    fn reply_get_stop_reason(&mut self, which: DbgThreadId, sig: i32);
    fn reply_get_thread_list(&mut self, threads: &[DbgThreadId]);
    /// `status` is 0 for success, -1 for "unsupported".
    fn reply_watchpoint_request(&mut self, status: i32);
    fn reply_read_siginfo(&mut self, si_bytes: &[u8]);
    fn reply_write_siginfo(&mut self);

    /// Notify the client that `thread` stopped with `sig` (0 for an
    /// interrupt acknowledgement). A non-null `watch_addr` names the
    /// watchpoint that triggered.
    fn notify_stop(&mut self, thread: DbgThreadId, sig: i32, watch_addr: RemotePtr<u8>);
    fn notify_exit_code(&mut self, code: i32);
}

/// Where debugger connections come from. The replay controller asks for
/// one at startup (unless on autopilot) and again for emergency debugging,
/// where the port is the troubled task's pid.
pub trait DbgServer {
    fn await_client_connection(&mut self, port: i32) -> Box<dyn DbgConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_request_classification() {
        assert!(DbgRequest::ResumeContinue.is_resume_request());
        assert!(DbgRequest::ResumeStep(42).is_resume_request());
        assert!(!DbgRequest::GetThreadList.is_resume_request());
        assert!(!DbgRequest::ReadSigInfo(128).is_resume_request());
        assert!(!DbgRequest::Restart.is_resume_request());
    }

    #[test]
    fn breakpoint_request_classification() {
        let addr = RemotePtr::new_from_val(0x400500);
        assert!(DbgRequest::SetSwBreak(addr, 1).is_breakpoint_request());
        assert!(DbgRequest::RemoveRdWrWatch(addr, 4).is_breakpoint_request());
        assert!(!DbgRequest::ResumeContinue.is_breakpoint_request());
        assert!(!DbgRequest::GetMem(addr, 16).is_breakpoint_request());
    }
}
