use crate::kernel_metadata::{ptrace_event_name, signal_name};
use libc::{SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::{Display, Formatter, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop.
    PtraceEvent,
}

/// A raw `waitpid()` status word and the queries the replay loop needs
/// against it.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }

        fatal!("Status {:#x} not understood", self.status);
        unreachable!()
    }

    /// Exit code if the tracee exited normally, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if unsafe { WIFEXITED(self.status) } {
            Some(unsafe { WEXITSTATUS(self.status) })
        } else {
            None
        }
    }

    /// Fatal signal if the tracee was killed by one, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        if unsafe { WIFSIGNALED(self.status) } {
            Some(unsafe { WTERMSIG(self.status) })
        } else {
            None
        }
    }

    /// The stopping signal, with syscall-stops and ptrace-event stops
    /// filtered out. A `(SIGTRAP | 0x80)` stop is a syscall boundary under
    /// PTRACE_O_TRACESYSGOOD, not a signal delivery.
    pub fn stop_sig(&self) -> Option<i32> {
        if !unsafe { WIFSTOPPED(self.status) } || (self.status >> 16) & 0xff != 0 {
            return None;
        }

        let sig = unsafe { WSTOPSIG(self.status) };
        if sig == SIGTRAP | 0x80 {
            return None;
        }

        Some(sig)
    }

    /// True for a syscall-entry or -exit stop.
    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !unsafe { WIFSTOPPED(self.status) } {
            return false;
        }

        unsafe { WSTOPSIG(self.status) == SIGTRAP | 0x80 }
    }

    pub fn ptrace_event(&self) -> Option<i32> {
        let event = (self.status >> 16) & 0xff;
        if event == 0 {
            None
        } else {
            Some(event)
        }
    }

    /// The signal the stopped tracee has pending, the way the replay
    /// stepping loop wants it: syscall boundaries count as "no signal".
    pub fn pending_signal(&self) -> i32 {
        self.stop_sig().unwrap_or(0)
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => write!(f, " ({})", signal_name(self.fatal_sig().unwrap())),
            WaitType::SignalStop => write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap())),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop_status(sig: i32) -> WaitStatus {
        WaitStatus::new((sig << 8) | 0x7f)
    }

    #[test]
    fn exit_status() {
        let status = WaitStatus::new(0);
        assert_eq!(Some(0), status.exit_code());
        assert_eq!(WaitType::Exit, status.wait_type());
        assert_eq!(0, status.pending_signal());
    }

    #[test]
    fn signal_stop() {
        let status = stop_status(libc::SIGTRAP);
        assert_eq!(Some(libc::SIGTRAP), status.stop_sig());
        assert_eq!(WaitType::SignalStop, status.wait_type());
        assert_eq!(libc::SIGTRAP, status.pending_signal());
        assert!(!status.is_syscall());
    }

    #[test]
    fn syscall_stop_is_not_a_signal() {
        let status = stop_status(libc::SIGTRAP | 0x80);
        assert!(status.is_syscall());
        assert_eq!(None, status.stop_sig());
        assert_eq!(0, status.pending_signal());
        assert_eq!(WaitType::SyscallStop, status.wait_type());
    }

    #[test]
    fn ptrace_event_stop() {
        let status =
            WaitStatus::new((libc::PTRACE_EVENT_EXIT << 16) | (libc::SIGTRAP << 8) | 0x7f);
        assert_eq!(Some(libc::PTRACE_EVENT_EXIT), status.ptrace_event());
        assert_eq!(None, status.stop_sig());
        assert_eq!(WaitType::PtraceEvent, status.wait_type());
    }

    #[test]
    fn fatal_signal() {
        let status = WaitStatus::new(libc::SIGKILL);
        assert_eq!(Some(libc::SIGKILL), status.fatal_sig());
        assert_eq!(WaitType::FatalSignal, status.wait_type());
    }
}
