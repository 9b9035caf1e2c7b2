use crate::bindings::ptrace::{PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP};
use crate::kernel_metadata::{errno_name, ptrace_event_name, signal_name};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::perf_counters::PerfCounters;
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use crate::trace::TraceFrame;
use crate::util::{pread_all_fallible, pwrite_all_fallible};
use crate::wait_status::WaitStatus;
use libc::{c_uint, c_void, pid_t};
use nix::errno::errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ptr;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeRequest {
    /// Run to the next syscall boundary.
    ResumeSyscall,
    /// Run to the next syscall boundary; the syscall reached will be
    /// skipped when the task is next resumed any way other than SYSEMU.
    ResumeSysemu,
    ResumeSinglestep,
    ResumeSysemuSinglestep,
}

/// The per-tracee surface the replay and diversion engines drive. The
/// concrete implementation talks to the kernel; tests substitute scripted
/// tasks.
pub trait Task {
    /// The pid the task currently runs under.
    fn tid(&self) -> pid_t;
    /// The pid the task had during recording; this is what debuggers and
    /// the trace see.
    fn rec_tid(&self) -> pid_t;

    /// The trace frame being replayed for this task.
    fn frame(&self) -> &TraceFrame;
    fn set_frame(&mut self, frame: TraceFrame);

    /// The signal observed at the last stop and not yet consumed, or 0.
    fn pending_sig(&self) -> i32;
    fn set_pending_sig(&mut self, sig: i32);

    fn status(&self) -> WaitStatus;

    /// Read the task's current register file. The task must be stopped.
    fn regs(&mut self) -> Registers;
    fn set_regs(&mut self, regs: &Registers);

    fn read_mem(&mut self, addr: RemotePtr<u8>, len: usize) -> Vec<u8>;
    fn write_mem(&mut self, addr: RemotePtr<u8>, buf: &[u8]);

    /// Resume the task, delivering `sig` (0 for none).
    fn resume_execution(&mut self, how: ResumeRequest, sig: i32);
    /// Block until the next stop; records the status and the pending
    /// signal.
    fn wait(&mut self) -> WaitStatus;

    /// Execute one syscall in the tracee, taking the number and arguments
    /// from `callregs` and leaving every register the way it was found.
    /// The task must be stopped at a syscall entry; the kernel reads the
    /// number from the latched syscall slot and the result appears at the
    /// exit stop. Returns the register file at the exit stop.
    fn inject_and_execute_syscall(&mut self, callregs: &Registers) -> Registers;

    /// Step over the syscall instruction without executing it, preserving
    /// the register file; this "exits" an emulated syscall.
    fn finish_emulated_syscall(&mut self);

    /// Re-arm the ticks counter with `period` (0 means no interrupt).
    fn reset_hpc(&mut self, period: Ticks);
    fn read_ticks(&mut self) -> Ticks;
    fn stop_hpc(&mut self);

    /// Fork the tracee through an injected fork() and return a task bound
    /// to the child, for use in a diversion session. The task must be
    /// stopped at a syscall entry.
    fn fork_diversion(&mut self) -> Box<dyn Task>;

    /// Forcibly end the tracee and reap it.
    fn kill(&mut self);

    fn ip(&mut self) -> RemotePtr<u8> {
        self.regs().ip()
    }
}

/// A tracee controlled with ptrace. Registers flow over
/// PTRACE_GETREGS/SETREGS; memory flows over /proc/<tid>/mem, which unlike
/// POKEDATA writes through write-protected text pages (where breakpoint
/// bytes land).
pub struct ReplayTask {
    tid: pid_t,
    rec_tid: pid_t,
    frame: TraceFrame,
    pending_sig: i32,
    status: WaitStatus,
    hpc: PerfCounters,
    mem_fd: ScopedFd,
}

impl ReplayTask {
    pub fn new(tid: pid_t, rec_tid: pid_t) -> ReplayTask {
        ReplayTask {
            tid,
            rec_tid,
            frame: TraceFrame::default(),
            pending_sig: 0,
            status: WaitStatus::default(),
            hpc: PerfCounters::new(tid),
            mem_fd: ScopedFd::new(),
        }
    }

    fn fallible_ptrace(&self, request: c_uint, addr: *mut c_void, data: *mut c_void) -> i64 {
        unsafe { libc::ptrace(request, self.tid, addr, data) as i64 }
    }

    /// ptrace or die.
    fn xptrace(&self, request: c_uint, addr: *mut c_void, data: *mut c_void) {
        unsafe {
            nix::errno::Errno::clear();
        }
        let ret = self.fallible_ptrace(request, addr, data);
        if ret < 0 && errno() != 0 {
            fatal!(
                "ptrace({}) of task {} failed: {}",
                request,
                self.tid,
                errno_name(errno())
            );
        }
    }

    fn open_mem_fd(&mut self) {
        if self.mem_fd.is_open() {
            return;
        }
        let path = format!("/proc/{}/mem", self.tid);
        match nix::fcntl::open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => self.mem_fd = ScopedFd::from_raw(fd),
            Err(err) => {
                fatal!("Failed to open {}: {:?}", path, err);
            }
        }
    }

    fn raw_waitpid(&mut self) -> WaitStatus {
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
        if ret != self.tid {
            fatal!(
                "waitpid({}) failed: {}",
                self.tid,
                errno_name(errno())
            );
        }
        WaitStatus::new(raw_status)
    }
}

impl Task for ReplayTask {
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
        let mut regs = Registers::new();
        self.xptrace(
            libc::PTRACE_GETREGS,
            ptr::null_mut(),
            regs.raw_mut() as *mut libc::user_regs_struct as *mut c_void,
        );
        regs
    }

    fn set_regs(&mut self, regs: &Registers) {
        let mut raw = *regs.raw();
        self.xptrace(
            libc::PTRACE_SETREGS,
            ptr::null_mut(),
            &mut raw as *mut libc::user_regs_struct as *mut c_void,
        );
    }

    fn read_mem(&mut self, addr: RemotePtr<u8>, len: usize) -> Vec<u8> {
        self.open_mem_fd();
        let mut buf = vec![0u8; len];
        match pread_all_fallible(self.mem_fd.as_raw(), &mut buf, addr.as_uint() as isize) {
            Ok(nread) if nread == len => buf,
            _ => {
                fatal!(
                    "Failed to read {} bytes at {} from task {}",
                    len,
                    addr,
                    self.tid
                );
                unreachable!()
            }
        }
    }

    fn write_mem(&mut self, addr: RemotePtr<u8>, buf: &[u8]) {
        self.open_mem_fd();
        match pwrite_all_fallible(self.mem_fd.as_raw(), buf, addr.as_uint() as isize) {
            Ok(written) if written == buf.len() => (),
            _ => {
                fatal!(
                    "Failed to write {} bytes at {} to task {}",
                    buf.len(),
                    addr,
                    self.tid
                );
            }
        }
    }

    fn resume_execution(&mut self, how: ResumeRequest, sig: i32) {
        let request: c_uint = match how {
            ResumeRequest::ResumeSyscall => libc::PTRACE_SYSCALL,
            ResumeRequest::ResumeSysemu => PTRACE_SYSEMU,
            ResumeRequest::ResumeSinglestep => libc::PTRACE_SINGLESTEP,
            ResumeRequest::ResumeSysemuSinglestep => PTRACE_SYSEMU_SINGLESTEP,
        };
        log!(
            LogDebug,
            "resuming task {} with {:?}, sig {}",
            self.tid,
            how,
            signal_name(sig)
        );
        self.xptrace(request, ptr::null_mut(), sig as u64 as *mut c_void);
    }

    fn wait(&mut self) -> WaitStatus {
        self.status = self.raw_waitpid();
        self.pending_sig = self.status.pending_signal();
        self.status
    }

    fn inject_and_execute_syscall(&mut self, callregs: &Registers) -> Registers {
        let orig_regs = self.regs();

        // At a syscall-entry stop the kernel takes the number from the
        // latched slot, not from the pre-syscall accumulator.
        let mut call = *callregs;
        call.set_original_syscallno(callregs.syscallno());
        self.set_regs(&call);

        self.resume_execution(ResumeRequest::ResumeSyscall, 0);
        self.wait();
        ed_assert!(
            &*self,
            self.pending_sig == 0,
            "Injected syscall interrupted by {}",
            signal_name(self.pending_sig)
        );

        let result = self.regs();
        log!(
            LogDebug,
            "injected syscall {} returned {:#x}",
            callregs.syscallno(),
            result.syscall_result()
        );
        self.set_regs(&orig_regs);
        result
    }

    fn finish_emulated_syscall(&mut self) {
        let regs = self.regs();

        self.resume_execution(ResumeRequest::ResumeSysemuSinglestep, 0);
        self.wait();

        self.set_regs(&regs);
        self.pending_sig = 0;
        self.status = WaitStatus::default();
    }

    fn reset_hpc(&mut self, period: Ticks) {
        self.hpc.reset(period);
    }

    fn read_ticks(&mut self) -> Ticks {
        self.hpc.read_ticks()
    }

    fn stop_hpc(&mut self) {
        self.hpc.stop();
    }

    fn fork_diversion(&mut self) -> Box<dyn Task> {
        // Have the fork reported as a ptrace event so the child arrives
        // already traced.
        let options = libc::PTRACE_O_TRACESYSGOOD | libc::PTRACE_O_TRACEFORK;
        self.xptrace(
            libc::PTRACE_SETOPTIONS,
            ptr::null_mut(),
            options as u64 as *mut c_void,
        );

        let orig_regs = self.regs();
        let mut call = orig_regs;
        call.set_syscallno(libc::SYS_fork);
        call.set_original_syscallno(libc::SYS_fork);
        self.set_regs(&call);

        self.resume_execution(ResumeRequest::ResumeSyscall, 0);
        let mut status = self.wait();
        ed_assert!(
            &*self,
            status.ptrace_event() == Some(libc::PTRACE_EVENT_FORK),
            "Expected PTRACE_EVENT_FORK, got {}",
            ptrace_event_name(status.ptrace_event().unwrap_or(0))
        );

        let mut child_tid: u64 = 0;
        self.xptrace(
            libc::PTRACE_GETEVENTMSG,
            ptr::null_mut(),
            &mut child_tid as *mut u64 as *mut c_void,
        );

        // Run the parent to the fork's exit stop, then put its registers
        // back.
        self.resume_execution(ResumeRequest::ResumeSyscall, 0);
        status = self.wait();
        ed_assert!(&*self, status.is_syscall(), "Expected fork exit stop");
        self.set_regs(&orig_regs);

        let mut child = Box::new(ReplayTask::new(child_tid as pid_t, self.rec_tid));
        child.frame = self.frame;

        // Reap the child's initial stop and match the parent's ptrace
        // setup. The SIGSTOP that delivered the stop is suppressed when the
        // diversion first resumes the child.
        child.wait();
        child.pending_sig = 0;
        child.xptrace(
            libc::PTRACE_SETOPTIONS,
            ptr::null_mut(),
            (libc::PTRACE_O_TRACESYSGOOD | libc::PTRACE_O_TRACEEXIT) as u64 as *mut c_void,
        );
        log!(
            LogDebug,
            "forked diversion task {} from {}",
            child.tid,
            self.tid
        );
        child
    }

    fn kill(&mut self) {
        log!(LogDebug, "killing task {}", self.tid);
        unsafe {
            libc::kill(self.tid, libc::SIGKILL);
        }
        // A PTRACE_EVENT_EXIT stop can arrive before the real exit; push
        // through it.
        loop {
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
            if ret != self.tid {
                break;
            }
            let status = WaitStatus::new(raw_status);
            if status.exit_code().is_some() || status.fatal_sig().is_some() {
                break;
            }
            if self.fallible_ptrace(libc::PTRACE_CONT, ptr::null_mut(), ptr::null_mut()) < 0 {
                log!(
                    LogWarn,
                    "Failed to continue task {} past its exit stop",
                    self.tid
                );
                break;
            }
        }
        self.hpc.stop();
    }
}
