pub fn signal_name(sig: i32) -> String {
    /* strsignal() would be nice to use here, but it provides TMI. */
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        /* Special-case this so we don't need to format in this common case.
         * This case is common because we often pass signal_name(sig) to
         * assertions when sig is 0. */
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: i32) -> String {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        /* Special-case this. This case is common because we often pass
         * ptrace_event_name(event) to assertions when event is 0. */
        0 => "PTRACE_EVENT(0)".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::E2BIG => "E2BIG".into(),
        libc::ENOEXEC => "ENOEXEC".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::ENOTBLK => "ENOTBLK".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::EXDEV => "EXDEV".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::ENOTTY => "ENOTTY".into(),
        libc::ETXTBSY => "ETXTBSY".into(),
        libc::EFBIG => "EFBIG".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ESPIPE => "ESPIPE".into(),
        libc::EROFS => "EROFS".into(),
        libc::EMLINK => "EMLINK".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::EDOM => "EDOM".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::EDEADLK => "EDEADLK".into(),
        libc::ENAMETOOLONG => "ENAMETOOLONG".into(),
        libc::ENOLCK => "ENOLCK".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ENOTEMPTY => "ENOTEMPTY".into(),
        libc::ELOOP => "ELOOP".into(),
        libc::ENOMSG => "ENOMSG".into(),
        libc::EIDRM => "EIDRM".into(),
        libc::ETIME => "ETIME".into(),
        libc::EPROTO => "EPROTO".into(),
        libc::EBADMSG => "EBADMSG".into(),
        libc::EOVERFLOW => "EOVERFLOW".into(),
        libc::EILSEQ => "EILSEQ".into(),
        libc::ERESTART => "ERESTART".into(),
        libc::ENOTSOCK => "ENOTSOCK".into(),
        libc::EMSGSIZE => "EMSGSIZE".into(),
        libc::EOPNOTSUPP => "EOPNOTSUPP".into(),
        libc::EADDRINUSE => "EADDRINUSE".into(),
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL".into(),
        libc::ECONNABORTED => "ECONNABORTED".into(),
        libc::ECONNRESET => "ECONNRESET".into(),
        libc::ENOBUFS => "ENOBUFS".into(),
        libc::ENOTCONN => "ENOTCONN".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        libc::ECONNREFUSED => "ECONNREFUSED".into(),
        libc::EALREADY => "EALREADY".into(),
        libc::EINPROGRESS => "EINPROGRESS".into(),
        libc::ESTALE => "ESTALE".into(),
        libc::EDQUOT => "EDQUOT".into(),
        libc::ECANCELED => "ECANCELED".into(),
        libc::EOWNERDEAD => "EOWNERDEAD".into(),
        libc::ENOTRECOVERABLE => "ENOTRECOVERABLE".into(),
        _ => format!("errno({})", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_signal_names() {
        assert_eq!("SIGTRAP", signal_name(libc::SIGTRAP));
        assert_eq!("SIGSTKFLT", signal_name(libc::SIGSTKFLT));
        assert_eq!("signal(0)", signal_name(0));
        assert_eq!("SIGRT42", signal_name(42));
    }

    #[test]
    fn common_errno_names() {
        assert_eq!("EACCES", errno_name(libc::EACCES));
        assert_eq!("SUCCESS", errno_name(0));
        assert_eq!("errno(9999)", errno_name(9999));
    }
}
