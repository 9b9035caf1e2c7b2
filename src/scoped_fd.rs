use nix::unistd::close;
use std::os::unix::io::RawFd;

/// An owned file descriptor. The wrapped fd is closed exactly once, either
/// by an explicit `close()` or when the owner goes out of scope.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            close(self.fd).ok();
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_relinquishes_ownership() {
        let mut fd = ScopedFd::from_raw(42);
        assert!(fd.is_open());
        assert_eq!(42, fd.extract());
        assert!(!fd.is_open());
    }
}
