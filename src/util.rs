use std::env;
use std::ffi::c_void;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::slice;

/// True when this process is itself a tracee of an outer instance of the
/// engine. The outer instance presents idealized performance counters, so
/// hardware bug probes are pointless (and would waste one of its PMCs).
pub fn running_under_retrace() -> bool {
    env::var("RUNNING_UNDER_RETRACE").is_ok()
}

/// View a POD value as its raw bytes.
pub fn u8_slice<T>(data: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(data as *const T as *const u8, size_of::<T>()) }
}

/// Like pread64(2) but retries on short reads until `buf` is full.
pub fn pread_all_fallible(fd: RawFd, buf_initial: &mut [u8], offset: isize) -> Result<usize, ()> {
    let mut nread: usize = 0;
    let mut buf = &mut buf_initial[..];

    while !buf.is_empty() {
        let ret: isize = unsafe {
            libc::pread64(
                fd,
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                (offset + nread as isize) as i64,
            )
        };

        if ret == 0 {
            return Ok(nread);
        } else if ret < 0 {
            return Err(());
        } else {
            buf = &mut buf[ret as usize..];
            nread += ret as usize;
        }
    }

    Ok(nread)
}

/// Like pwrite64(2) but we try to write all bytes by looping on short writes.
pub fn pwrite_all_fallible(fd: RawFd, buf_initial: &[u8], offset: isize) -> Result<usize, ()> {
    let mut written: usize = 0;
    let mut buf = buf_initial;

    while !buf.is_empty() {
        let ret: isize = unsafe {
            libc::pwrite64(
                fd,
                buf.as_ptr().cast::<c_void>(),
                buf.len(),
                (offset + written as isize) as i64,
            )
        };

        if ret == 0 {
            return Ok(written);
        } else if ret < 0 {
            return Err(());
        } else {
            buf = &buf[ret as usize..];
            written += ret as usize;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_slice_views_all_bytes() {
        let v: u64 = 0x0102_0304_0506_0708;
        let bytes = u8_slice(&v);
        assert_eq!(8, bytes.len());
        assert_eq!(0x08, bytes[0]);
        assert_eq!(0x01, bytes[7]);
    }
}
