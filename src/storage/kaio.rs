//! Kernel AIO plumbing: `io_setup`/`io_submit`/`io_getevents` wrappers,
//! the completion eventfd, aligned buffers for direct I/O and the startup
//! capability probe.
//!
//! Kernel support for `RWF_NOWAIT`/`RWF_DSYNC`/`RWF_HIPRI` varies by
//! version and filesystem, so nothing here is decided at compile time: the
//! probe runs once against the data directory and the writer branches on
//! the returned [`Capabilities`] struct.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use super::writer::Capabilities;

pub type AioContextT = libc::c_ulong;

pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_FLAG_RESFD: u32 = 1;

pub const RWF_HIPRI: i32 = 0x1;
pub const RWF_DSYNC: i32 = 0x2;
pub const RWF_NOWAIT: i32 = 0x8;

/// `struct iocb` from `linux/aio_abi.h` (little-endian field order).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    /// A pwrite request for `len` bytes of `buf` at `offset`.
    pub fn pwrite(fd: RawFd, buf: *const u8, len: usize, offset: u64) -> Iocb {
        Iocb {
            aio_data: 0,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: IOCB_CMD_PWRITE,
            aio_reqprio: 0,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        }
    }
}

/// `struct io_event` from `linux/aio_abi.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

/// An owned kernel AIO context.
#[derive(Debug)]
pub struct AioContext {
    ctx: AioContextT,
}

// The context handle is just a kernel token.
unsafe impl Send for AioContext {}
unsafe impl Sync for AioContext {}

impl AioContext {
    pub fn setup(nr_events: u32) -> io::Result<AioContext> {
        let mut ctx: AioContextT = 0;
        let rv = unsafe {
            libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, &mut ctx as *mut AioContextT)
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(AioContext { ctx })
    }

    /// Submit a single request. Non-blocking when the iocb carries
    /// `RWF_NOWAIT`; may block inside the kernel otherwise.
    pub fn submit(&self, iocb: &mut Iocb) -> io::Result<()> {
        let mut ptr = iocb as *mut Iocb;
        let rv = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                &mut ptr as *mut *mut Iocb,
            )
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reap up to `events.len()` completions, waiting for at least `min`.
    pub fn getevents(&self, min: usize, events: &mut [IoEvent]) -> io::Result<usize> {
        loop {
            let rv = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min as libc::c_long,
                    events.len() as libc::c_long,
                    events.as_mut_ptr(),
                    std::ptr::null_mut::<libc::timespec>(),
                )
            };
            if rv < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            return Ok(rv as usize);
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_io_destroy, self.ctx);
        }
    }
}

/// Non-blocking eventfd signalled by AIO completions (`IOCB_FLAG_RESFD`).
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Read and reset the counter. `Ok(None)` when the fd is not ready.
    /// The value only says "something completed": it is an advisory wake,
    /// never a completion count to trust.
    pub fn drain(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        let rv = unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8)
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(u64::from_le_bytes(buf)))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Switch an open descriptor to direct I/O.
pub fn set_direct_io(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rv = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Heap buffer aligned for direct I/O. Length is always a multiple of the
/// alignment.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    align: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Copy `data` into a fresh aligned buffer, zero-padded up to a
    /// multiple of `align`.
    pub fn from_slice(data: &[u8], align: usize) -> AlignedBuf {
        assert!(align.is_power_of_two());
        let len = data.len().div_ceil(align) * align;
        let layout = std::alloc::Layout::from_size_align(len.max(align), align)
            .expect("aligned buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned buffer allocation failed");
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        AlignedBuf { ptr, len: len.max(align), align }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len, self.align)
            .expect("aligned buffer layout");
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

/// Submit one aligned probe write with the given `rw_flags` and report
/// whether the kernel accepted it. `EAGAIN` counts as accepted: the flag is
/// understood, the write just could not run non-blocking right now.
fn probe_rwf(ctx: &AioContext, fd: RawFd, buf: &AlignedBuf, offset: u64, rw_flags: i32) -> bool {
    let mut iocb = Iocb::pwrite(fd, buf.as_ptr(), buf.len(), offset);
    iocb.aio_rw_flags = rw_flags;
    match ctx.submit(&mut iocb) {
        Err(e) => matches!(e.raw_os_error(), Some(libc::EAGAIN)),
        Ok(()) => {
            let mut events = [IoEvent::default(); 1];
            match ctx.getevents(1, &mut events) {
                Ok(1) => {
                    events[0].res >= 0 || events[0].res == -(libc::EAGAIN as i64)
                }
                _ => false,
            }
        }
    }
}

/// Filesystem block size for the data directory, defaulting to 4 KiB.
fn block_size(dir: &Path) -> usize {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(path) = CString::new(dir.as_os_str().as_bytes()) else {
        return 4096;
    };
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rv = unsafe { libc::statfs(path.as_ptr(), &mut stat) };
    if rv != 0 {
        return 4096;
    }
    let bsize = stat.f_bsize as usize;
    if bsize.is_power_of_two() && (512..=65536).contains(&bsize) {
        bsize
    } else {
        4096
    }
}

/// Probe what the kernel and the data directory's filesystem support.
/// Any failure degrades to the conservative answer for that capability.
pub fn probe(dir: &Path) -> Capabilities {
    let mut caps = Capabilities::conservative();
    caps.block_size = block_size(dir);

    let path = dir.join(".probe");
    let _ = std::fs::remove_file(&path);
    let file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(_) => return caps,
    };
    let fd = file.as_raw_fd();

    caps.direct_io = set_direct_io(fd).is_ok();

    if let Ok(ctx) = AioContext::setup(2) {
        caps.kaio = true;
        let buf = AlignedBuf::from_slice(&vec![0u8; caps.block_size], caps.block_size);
        caps.dsync = probe_rwf(&ctx, fd, &buf, 0, RWF_DSYNC);
        caps.hipri = probe_rwf(&ctx, fd, &buf, 0, RWF_HIPRI);
        caps.nowait = probe_rwf(&ctx, fd, &buf, 0, RWF_NOWAIT);
    }

    drop(file);
    let _ = std::fs::remove_file(&path);
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn aligned_buf_copies_and_pads() {
        let buf = AlignedBuf::from_slice(b"hello", 4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert_eq!(&bytes[..5], b"hello");
        assert!(bytes[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn probe_reports_some_block_size() {
        let dir = TempDir::new().unwrap();
        let caps = probe(dir.path());
        assert!(caps.block_size.is_power_of_two());
        // Whatever the kernel supports, the probe file must be gone.
        assert!(!dir.path().join(".probe").exists());
    }

    #[test]
    fn eventfd_is_initially_unreadable() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.drain().unwrap(), None);
    }
}
