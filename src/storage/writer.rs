//! Asynchronous disk writer for segment files.
//!
//! The writer owns one open segment file and a FIFO of write requests.
//! Requests move through explicit states (queued, in flight, done,
//! cancelled) driven by reactor events; exactly one request is in flight
//! at a time, so batches complete in submission order.
//!
//! Preferred submission path: kernel AIO with `RWF_NOWAIT` and the
//! completion eventfd registered with the reactor. A submission that would
//! block, or a kernel without the needed flags, falls back to a worker
//! thread. Without kernel AIO at all the file is opened `O_DSYNC` and every
//! write runs on the worker path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task;

use super::metadata::sync_dir;
use super::StorageError;

/// What the kernel and the data directory's filesystem were probed to
/// support. Decided once at startup; the writer branches on this struct.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Kernel AIO contexts are available.
    pub kaio: bool,
    /// The filesystem accepts `O_DIRECT`.
    pub direct_io: bool,
    /// `io_submit` honours `RWF_NOWAIT`.
    pub nowait: bool,
    /// Per-request `RWF_DSYNC` is honoured (otherwise files are opened
    /// `O_DSYNC`).
    pub dsync: bool,
    /// `RWF_HIPRI` is honoured.
    pub hipri: bool,
    /// Filesystem block size; batch writes are aligned to this.
    pub block_size: usize,
}

impl Capabilities {
    /// Assume nothing: buffered `O_DSYNC` writes on a worker thread.
    pub fn conservative() -> Self {
        Capabilities {
            kaio: false,
            direct_io: false,
            nowait: false,
            dsync: false,
            hipri: false,
            block_size: 4096,
        }
    }

    /// Probe the data directory once at startup.
    pub fn probe(dir: &Path) -> Self {
        #[cfg(target_os = "linux")]
        {
            super::kaio::probe(dir)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = dir;
            Self::conservative()
        }
    }
}

enum Request {
    Write {
        buf: Vec<u8>,
        offset: u64,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the writer task for one open segment file.
///
/// Dropping the handle without [`SegmentWriter::close`] abandons the task;
/// queued requests then complete with [`StorageError::Closed`].
#[derive(Debug)]
pub struct SegmentWriter {
    tx: mpsc::UnboundedSender<Request>,
}

impl SegmentWriter {
    /// Create `path` preallocated to `size` bytes (file and directory both
    /// synced before use) and spawn the writer task for it.
    pub async fn create(
        path: PathBuf,
        size: u64,
        caps: Capabilities,
    ) -> Result<SegmentWriter, StorageError> {
        let create_caps = caps.clone();
        let file = task::spawn_blocking(move || create_segment_file(&path, size, &create_caps))
            .await
            .map_err(|e| StorageError::Io(format!("segment create task failed: {}", e)))??;
        Ok(Self::spawn(file, caps))
    }

    fn spawn(file: std::fs::File, caps: Capabilities) -> SegmentWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(Arc::new(file), caps, rx));
        SegmentWriter { tx }
    }

    /// Queue a durable write of `buf` at `offset`, returning a completion
    /// handle. `offset` and the buffer length must be block-aligned.
    pub fn submit(
        &self,
        buf: Vec<u8>,
        offset: u64,
    ) -> Result<oneshot::Receiver<Result<(), StorageError>>, StorageError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Request::Write { buf, offset, done })
            .map_err(|_| StorageError::Closed)?;
        Ok(rx)
    }

    /// Queue a write and wait for it to be durable.
    pub async fn write(&self, buf: Vec<u8>, offset: u64) -> Result<(), StorageError> {
        let rx = self.submit(buf, offset)?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    /// Drain: outstanding writes are awaited (not cancelled), then the file
    /// descriptor and AIO context are released.
    pub async fn close(self) -> Result<(), StorageError> {
        let (done, rx) = oneshot::channel();
        self.tx.send(Request::Close { done }).map_err(|_| StorageError::Closed)?;
        rx.await.map_err(|_| StorageError::Closed)
    }
}

/// Open, preallocate and sync a fresh segment file.
fn create_segment_file(
    path: &Path,
    size: u64,
    caps: &Capabilities,
) -> Result<std::fs::File, StorageError> {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    // Without per-request sync the file itself must be synchronous.
    if !(caps.kaio && caps.dsync) {
        options.custom_flags(libc::O_DSYNC);
    }
    let file = options.open(path)?;

    let rv = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if rv != 0 {
        let err = std::io::Error::from_raw_os_error(rv);
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(err.into());
    }
    file.sync_all()?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }

    #[cfg(target_os = "linux")]
    if caps.direct_io {
        super::kaio::set_direct_io(file.as_raw_fd())?;
    }

    Ok(file)
}

async fn run(
    file: Arc<std::fs::File>,
    caps: Capabilities,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    #[cfg(target_os = "linux")]
    let mut aio = if caps.kaio { AioState::new().ok() } else { None };

    // Once a write fails the writer is latched: everything still queued and
    // everything submitted later fails fast until a fresh writer is built.
    let mut errored: Option<StorageError> = None;

    while let Some(request) = rx.recv().await {
        match request {
            Request::Close { done } => {
                let _ = done.send(());
                break;
            }
            Request::Write { buf, offset, done } => {
                if let Some(e) = &errored {
                    let _ = done.send(Err(e.clone()));
                    continue;
                }
                #[cfg(target_os = "linux")]
                let result = perform_write(&file, &caps, aio.as_mut(), buf, offset).await;
                #[cfg(not(target_os = "linux"))]
                let result = perform_write(&file, &caps, buf, offset).await;

                if let Err(e) = &result {
                    errored = Some(e.clone());
                }
                let _ = done.send(result);
            }
        }
    }
    // Remaining senders observe the dropped channel as `Closed`.
}

#[cfg(target_os = "linux")]
use linux::{perform_write, AioState};

#[cfg(not(target_os = "linux"))]
use fallback::perform_write;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    /// Buffered write on the worker pool, synced before completion.
    pub(super) async fn perform_write(
        file: &Arc<std::fs::File>,
        _caps: &Capabilities,
        buf: Vec<u8>,
        offset: u64,
    ) -> Result<(), StorageError> {
        let file = file.clone();
        task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            file.write_all_at(&buf, offset)?;
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(format!("write task failed: {}", e)))?
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::storage::kaio::{
        AioContext, AlignedBuf, EventFd, IoEvent, Iocb, IOCB_FLAG_RESFD, RWF_DSYNC, RWF_HIPRI,
        RWF_NOWAIT,
    };
    use std::os::fd::AsRawFd;
    use tokio::io::unix::AsyncFd;

    pub(super) struct AioState {
        ctx: AioContext,
        efd: AsyncFd<EventFd>,
    }

    impl AioState {
        pub(super) fn new() -> std::io::Result<AioState> {
            let ctx = AioContext::setup(1)?;
            let efd = AsyncFd::new(EventFd::new()?)?;
            Ok(AioState { ctx, efd })
        }
    }

    /// Wait on the eventfd, then drain whatever completions are ready. The
    /// eventfd counter is an advisory wake only: it is read and discarded,
    /// and all ready events are reaped regardless of its value.
    async fn await_completion(aio: &mut AioState) -> Result<IoEvent, StorageError> {
        loop {
            let mut guard = aio
                .efd
                .readable()
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            match aio.efd.get_ref().drain() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            let mut events = [IoEvent::default(); 1];
            let n = aio.ctx.getevents(0, &mut events).map_err(StorageError::from)?;
            if n == 0 {
                guard.clear_ready();
                continue;
            }
            return Ok(events[0]);
        }
    }

    /// Blocking fallback: submit on a dedicated context and wait for the
    /// completion synchronously on the worker pool.
    async fn worker_aio_write(
        file: &Arc<std::fs::File>,
        caps: &Capabilities,
        buf: AlignedBuf,
        offset: u64,
    ) -> Result<(), StorageError> {
        let file = file.clone();
        let rw_flags = base_rw_flags(caps);
        task::spawn_blocking(move || {
            let ctx = AioContext::setup(1)?;
            let mut iocb = Iocb::pwrite(file.as_raw_fd(), buf.as_ptr(), buf.len(), offset);
            iocb.aio_rw_flags = rw_flags;
            ctx.submit(&mut iocb)?;
            let mut events = [IoEvent::default(); 1];
            let n = ctx.getevents(1, &mut events)?;
            debug_assert_eq!(n, 1);
            check_result(&events[0], buf.len())
        })
        .await
        .map_err(|e| StorageError::Io(format!("write task failed: {}", e)))?
    }

    fn base_rw_flags(caps: &Capabilities) -> i32 {
        let mut flags = 0;
        if caps.dsync {
            flags |= RWF_DSYNC;
        }
        if caps.hipri {
            flags |= RWF_HIPRI;
        }
        flags
    }

    fn check_result(event: &IoEvent, expected: usize) -> Result<(), StorageError> {
        if event.res < 0 {
            let err = std::io::Error::from_raw_os_error((-event.res) as i32);
            return Err(StorageError::Io(err.to_string()));
        }
        if event.res as usize != expected {
            return Err(StorageError::Io(format!(
                "short segment write: {} of {} bytes",
                event.res, expected
            )));
        }
        Ok(())
    }

    /// Last-resort path: plain pwrite from an aligned buffer on the worker
    /// pool, followed by fdatasync in case the file is not open `O_DSYNC`.
    async fn worker_pwrite(
        file: &Arc<std::fs::File>,
        buf: AlignedBuf,
        offset: u64,
    ) -> Result<(), StorageError> {
        let file = file.clone();
        task::spawn_blocking(move || {
            let rv = unsafe {
                libc::pwrite(
                    file.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if rv < 0 {
                return Err(StorageError::from(std::io::Error::last_os_error()));
            }
            if rv as usize != buf.len() {
                return Err(StorageError::Io(format!(
                    "short segment write: {} of {} bytes",
                    rv,
                    buf.len()
                )));
            }
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(format!("write task failed: {}", e)))?
    }

    pub(super) async fn perform_write(
        file: &Arc<std::fs::File>,
        caps: &Capabilities,
        aio: Option<&mut AioState>,
        buf: Vec<u8>,
        offset: u64,
    ) -> Result<(), StorageError> {
        let buf = AlignedBuf::from_slice(&buf, caps.block_size);
        let Some(aio) = aio else {
            return worker_pwrite(file, buf, offset).await;
        };

        if caps.nowait {
            let mut iocb = Iocb::pwrite(file.as_raw_fd(), buf.as_ptr(), buf.len(), offset);
            iocb.aio_rw_flags = base_rw_flags(caps) | RWF_NOWAIT;
            iocb.aio_flags = IOCB_FLAG_RESFD;
            iocb.aio_resfd = aio.efd.get_ref().as_raw_fd() as u32;

            match aio.ctx.submit(&mut iocb) {
                Ok(()) => {
                    let event = await_completion(aio).await?;
                    // The write could not run non-blocking; retry on the
                    // worker pool without NOWAIT.
                    if event.res == -(libc::EAGAIN as i64) {
                        return worker_aio_write(file, caps, buf, offset).await;
                    }
                    return check_result(&event, buf.len());
                }
                // Submission itself would block.
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    return worker_aio_write(file, caps, buf, offset).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        worker_aio_write(file, caps, buf, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn block(byte: u8, caps: &Capabilities) -> Vec<u8> {
        vec![byte; caps.block_size]
    }

    #[tokio::test]
    async fn writes_land_at_their_offsets() {
        let dir = TempDir::new().unwrap();
        let caps = Capabilities::conservative();
        let path = dir.path().join("open-1");
        let writer = SegmentWriter::create(path.clone(), 4 * caps.block_size as u64, caps.clone())
            .await
            .unwrap();

        writer.write(block(0xAA, &caps), 0).await.unwrap();
        writer.write(block(0xBB, &caps), caps.block_size as u64).await.unwrap();
        writer.close().await.unwrap();

        let mut data = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len() as u64, 4 * caps.block_size as u64);
        assert!(data[..caps.block_size].iter().all(|&b| b == 0xAA));
        assert!(data[caps.block_size..2 * caps.block_size].iter().all(|&b| b == 0xBB));
        assert!(data[2 * caps.block_size..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn pipelined_submissions_complete_in_order() {
        let dir = TempDir::new().unwrap();
        let caps = Capabilities::conservative();
        let writer = SegmentWriter::create(
            dir.path().join("open-1"),
            8 * caps.block_size as u64,
            caps.clone(),
        )
        .await
        .unwrap();

        let first = writer.submit(block(1, &caps), 0).unwrap();
        let second = writer.submit(block(2, &caps), caps.block_size as u64).unwrap();
        // Both were queued without waiting; completions arrive FIFO.
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_rejects_later_writes() {
        let dir = TempDir::new().unwrap();
        let caps = Capabilities::conservative();
        let writer =
            SegmentWriter::create(dir.path().join("open-1"), 4096, caps.clone()).await.unwrap();
        let tx = writer.tx.clone();
        writer.close().await.unwrap();
        // The task is gone; queued requests observe Closed.
        let (done, rx) = oneshot::channel();
        let _ = tx.send(Request::Write { buf: vec![0; 4096], offset: 0, done });
        assert!(matches!(rx.await, Err(_) | Ok(Err(StorageError::Closed))));
    }

    #[tokio::test]
    async fn probed_capabilities_write_real_batches() {
        // Whatever this kernel/filesystem supports, the probed path must
        // produce the same bytes as the conservative one.
        let dir = TempDir::new().unwrap();
        let caps = Capabilities::probe(dir.path());
        let path = dir.path().join("open-9");
        let writer = SegmentWriter::create(path.clone(), 4 * caps.block_size as u64, caps.clone())
            .await
            .unwrap();
        writer.write(block(0x5A, &caps), 0).await.unwrap();
        writer.close().await.unwrap();

        let mut data = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut data).unwrap();
        assert!(data[..caps.block_size].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn segment_files_are_preallocated() {
        let dir = TempDir::new().unwrap();
        let caps = Capabilities::conservative();
        let file = create_segment_file(&dir.path().join("open-2"), 1 << 20, &caps).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
    }
}
