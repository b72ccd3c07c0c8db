// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-first backends for the kernel accessor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + integration tests under tests/
//!
//! PUBLIC API:
//!   - pipe(): anonymous OS pipe as a PipeReader/PipeWriter pair
//!   - EmulatedKernel: kernel image plus the pending I/O-vector state
//!   - EmulatedRedirect: IovRedirect over an EmulatedKernel (with injectable refusals)
//!   - EmulatedWorker: Privileged handler moving bytes between the pipes and the image
//!   - EmulatedScheduler: in-memory rtprio table with per-thread last error
//!   - Session: accessor + worker + scheduler wired from a Config
//!
//! The emulated worker blocks in real pipe I/O exactly like the privileged side would, so the
//! ordering between arming, redirect and stream transfer is exercised for real.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use kaccess_abi::rtprio::{
    RtPrioType, SchedulingClass, RTPRIO_SIZE, RTP_LOOKUP, RTP_PRIO_MAX, RTP_SET,
};
use kaccess_abi::{Command, Direction, KernelAddress, LwpId};
use parking_lot::{Condvar, Mutex};

use crate::accessor::{self, AccessorParts, IovRedirect, KernelAccessor};
use crate::command::{ChannelError, CommandChannel, Privileged, WorkerBuilder, WorkerHandle};
use crate::config::Config;
use crate::errno::{ErrorSource, OsError};
use crate::memory::{AddressSpace, HeapSpace};
use crate::rtprio::{RtPrio, RtPrioSyscall};

/// Largest chunk moved by one emulated transfer (one atomic pipe write).
pub const STAGING_LIMIT: usize = 4096;

/// Read end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeReader(OwnedFd);

/// Write end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeWriter(OwnedFd);

/// Creates an anonymous pipe.
pub fn pipe() -> io::Result<(PipeReader, PipeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors `pipe` writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((PipeReader(read), PipeWriter(write)))
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes and the descriptor is open.
        let n = unsafe { libc::read(self.0.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` readable bytes and the descriptor is open.
        let n = unsafe { libc::write(self.0.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Iov {
    Original,
    Redirected { direction: Direction, offset: usize, len: usize },
    Refused { direction: Direction, len: usize },
}

/// In-process stand-in for kernel memory and the worker's pending I/O vector.
#[derive(Debug)]
pub struct EmulatedKernel {
    base: KernelAddress,
    image: Mutex<Vec<u8>>,
    iov: Mutex<Iov>,
    iov_set: Condvar,
    refusals: AtomicUsize,
    swaps: AtomicUsize,
    spill: Mutex<Vec<u8>>,
}

impl EmulatedKernel {
    /// Zeroed image of `size` bytes starting at `base`.
    pub fn new(base: KernelAddress, size: usize) -> Self {
        Self {
            base,
            image: Mutex::new(vec![0; size]),
            iov: Mutex::new(Iov::Original),
            iov_set: Condvar::new(),
            refusals: AtomicUsize::new(0),
            swaps: AtomicUsize::new(0),
            spill: Mutex::new(Vec::new()),
        }
    }

    /// First address of the image.
    pub fn base(&self) -> KernelAddress {
        self.base
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.image.lock().len()
    }

    /// True for an empty image.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `count` redirects lose the race.
    pub fn fail_next_swaps(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Redirect attempts so far.
    pub fn swap_attempts(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    /// Bytes that landed in the original destination after a lost race.
    pub fn spilled(&self) -> Vec<u8> {
        self.spill.lock().clone()
    }

    fn range(&self, kaddr: KernelAddress, len: usize) -> Option<usize> {
        let offset = usize::try_from(kaddr.get().checked_sub(self.base.get())?).ok()?;
        (offset.checked_add(len)? <= self.len()).then_some(offset)
    }

    /// Copies `len` image bytes at `kaddr`; `None` outside the image.
    pub fn peek(&self, kaddr: KernelAddress, len: usize) -> Option<Vec<u8>> {
        let offset = self.range(kaddr, len)?;
        Some(self.image.lock()[offset..offset + len].to_vec())
    }

    /// Overwrites image bytes at `kaddr`; `false` outside the image.
    pub fn poke(&self, kaddr: KernelAddress, bytes: &[u8]) -> bool {
        match self.range(kaddr, bytes.len()) {
            Some(offset) => {
                self.image.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn redirect(&self, direction: Direction, kaddr: KernelAddress, len: usize) -> bool {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        let lost = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let outcome = match self.range(kaddr, len) {
            Some(offset) if !lost => Iov::Redirected { direction, offset, len },
            _ => Iov::Refused { direction, len },
        };
        let mut iov = self.iov.lock();
        *iov = outcome;
        self.iov_set.notify_all();
        matches!(outcome, Iov::Redirected { .. })
    }

    /// Waits for the accessor's redirect attempt and consumes it.
    fn take_iov(&self, expected: Direction) -> io::Result<Iov> {
        let mut iov = self.iov.lock();
        while *iov == Iov::Original {
            self.iov_set.wait(&mut iov);
        }
        let taken = std::mem::replace(&mut *iov, Iov::Original);
        match taken {
            Iov::Redirected { direction, .. } | Iov::Refused { direction, .. }
                if direction != expected =>
            {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("vector armed for {direction:?}, transfer is {expected:?}"),
                ))
            }
            other => Ok(other),
        }
    }
}

/// [`IovRedirect`] over an [`EmulatedKernel`].
#[derive(Debug, Clone)]
pub struct EmulatedRedirect {
    kernel: Arc<EmulatedKernel>,
}

impl EmulatedRedirect {
    /// Redirects into `kernel`.
    pub fn new(kernel: Arc<EmulatedKernel>) -> Self {
        Self { kernel }
    }
}

impl IovRedirect for EmulatedRedirect {
    fn swap(&mut self, direction: Direction, original: usize, kaddr: KernelAddress, len: usize)
        -> bool {
        let swapped = self.kernel.redirect(direction, kaddr, len);
        log::debug!(
            "emulation: {direction:?} vector {original:#x} -> {kaddr} ({len} bytes): {}",
            if swapped { "redirected" } else { "kept" }
        );
        swapped
    }
}

/// Privileged side of an emulated session.
#[derive(Debug)]
pub struct EmulatedWorker {
    kernel: Arc<EmulatedKernel>,
    from_accessor: Option<PipeReader>,
    to_accessor: Option<PipeWriter>,
}

impl EmulatedWorker {
    /// Serves `kernel`, reading copy-in bytes from `from_accessor` and feeding copy-out bytes
    /// into `to_accessor`.
    pub fn new(
        kernel: Arc<EmulatedKernel>,
        from_accessor: PipeReader,
        to_accessor: PipeWriter,
    ) -> Self {
        Self { kernel, from_accessor: Some(from_accessor), to_accessor: Some(to_accessor) }
    }

    fn land(&mut self) -> io::Result<()> {
        let reader = self.from_accessor.as_mut().ok_or_else(released)?;
        let mut staging = [0u8; STAGING_LIMIT];
        let n = reader.read(&mut staging)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "accessor stream closed"));
        }
        match self.kernel.take_iov(Direction::CopyIn)? {
            Iov::Redirected { offset, len, .. } => {
                let n = n.min(len);
                self.kernel.image.lock()[offset..offset + n].copy_from_slice(&staging[..n]);
            }
            _ => self.kernel.spill.lock().extend_from_slice(&staging[..n]),
        }
        Ok(())
    }

    fn supply(&mut self) -> io::Result<()> {
        let writer = self.to_accessor.as_mut().ok_or_else(released)?;
        let bytes = match self.kernel.take_iov(Direction::CopyOut)? {
            Iov::Redirected { offset, len, .. } => {
                self.kernel.image.lock()[offset..offset + len].to_vec()
            }
            Iov::Refused { len, .. } => vec![0; len],
            Iov::Original => Vec::new(),
        };
        writer.write_all(&bytes)
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker streams released")
}

impl Privileged for EmulatedWorker {
    fn transfer(&mut self, command: Command) -> io::Result<()> {
        match command {
            Command::Write => self.land(),
            Command::Read => self.supply(),
            Command::Idle | Command::Shutdown => Ok(()),
        }
    }

    fn release(&mut self) {
        self.from_accessor = None;
        self.to_accessor = None;
    }
}

#[derive(Debug, Default)]
struct SchedState {
    records: HashMap<i32, RtPrioType>,
    names: HashMap<i32, String>,
    bound: HashMap<ThreadId, i32>,
    errno: HashMap<ThreadId, i32>,
    next_lwp: i32,
}

impl SchedState {
    fn resolve(&mut self, lwpid: LwpId) -> i32 {
        if lwpid != LwpId::CURRENT {
            return lwpid.0;
        }
        let current = thread::current();
        if let Some(lwp) = self.bound.get(&current.id()) {
            return *lwp;
        }
        self.next_lwp += 1;
        let lwp = self.next_lwp;
        self.bound.insert(current.id(), lwp);
        self.records.insert(lwp, RtPrioType::new(SchedulingClass::Normal, 0));
        if let Some(name) = current.name() {
            self.names.insert(lwp, name.to_string());
        }
        lwp
    }
}

/// In-memory `rtprio_thread` table.
///
/// Every OS thread that addresses [`LwpId::CURRENT`] gets its own lightweight id on first use,
/// starting in the normal class at level 0. Failures record `ESRCH`/`EINVAL`/`EFAULT` as the
/// calling thread's last error.
#[derive(Debug)]
pub struct EmulatedScheduler {
    state: Mutex<SchedState>,
}

impl Default for EmulatedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedScheduler {
    const FIRST_LWP: i32 = 100_000;

    /// Empty table.
    pub fn new() -> Self {
        Self { state: Mutex::new(SchedState { next_lwp: Self::FIRST_LWP, ..Default::default() }) }
    }

    /// Lightweight id of the first thread named `name` that touched the table.
    pub fn lwp_named(&self, name: &str) -> Option<LwpId> {
        let state = self.state.lock();
        state.names.iter().find(|(_, n)| n.as_str() == name).map(|(lwp, _)| LwpId(*lwp))
    }

    fn fail(state: &mut SchedState, code: i32) -> i32 {
        state.errno.insert(thread::current().id(), code);
        -1
    }
}

impl RtPrioSyscall for EmulatedScheduler {
    fn rtprio_thread(&self, function: i32, lwpid: LwpId, rtp: &mut [u8]) -> i32 {
        let mut state = self.state.lock();
        if rtp.len() < RTPRIO_SIZE {
            return Self::fail(&mut state, libc::EFAULT);
        }
        let lwp = state.resolve(lwpid);
        if !state.records.contains_key(&lwp) {
            return Self::fail(&mut state, libc::ESRCH);
        }
        match function {
            RTP_LOOKUP => {
                if let Some(record) = state.records.get(&lwp) {
                    rtp[..RTPRIO_SIZE].copy_from_slice(&record.encode());
                }
                0
            }
            RTP_SET => match RtPrioType::decode(rtp) {
                Ok(record) if record.priority() <= RTP_PRIO_MAX => {
                    state.records.insert(lwp, record);
                    0
                }
                _ => Self::fail(&mut state, libc::EINVAL),
            },
            _ => Self::fail(&mut state, libc::EINVAL),
        }
    }
}

impl ErrorSource for EmulatedScheduler {
    fn last_error(&self, context: &str) -> OsError {
        let code = self.state.lock().errno.get(&thread::current().id()).copied().unwrap_or(0);
        OsError::new(context, code)
    }
}

/// Errors produced while starting or stopping a [`Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Pipe creation failed.
    #[error("failed to create session pipe: {0}")]
    Pipe(#[source] io::Error),
    /// Worker start or stop failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Accessor construction failed.
    #[error(transparent)]
    Accessor(#[from] accessor::Error),
    /// The staging buffer is larger than one emulated transfer can move.
    #[error("staging buffer of {requested} bytes exceeds the {limit}-byte transfer limit")]
    StagingTooLarge {
        /// Configured scratch size.
        requested: usize,
        /// [`STAGING_LIMIT`].
        limit: usize,
    },
}

/// Priority control used by emulated sessions.
pub type EmulatedRtPrio = RtPrio<Arc<EmulatedScheduler>>;

/// A complete accessor/worker pair over an emulated kernel.
pub struct Session {
    accessor: KernelAccessor,
    worker: WorkerHandle,
    kernel: Arc<EmulatedKernel>,
    scheduler: Arc<EmulatedScheduler>,
    rtprio: Arc<EmulatedRtPrio>,
}

impl Session {
    /// Builds pipes, kernel image, worker and accessor from `config`.
    pub fn start(config: &Config) -> Result<Self, SessionError> {
        let requested = config.accessor.scratch_size;
        if requested > STAGING_LIMIT {
            return Err(SessionError::StagingTooLarge { requested, limit: STAGING_LIMIT });
        }
        let kernel = Arc::new(EmulatedKernel::new(
            config.emulation.kernel_base,
            config.emulation.image_size,
        ));
        let (inbound, worker_out) = pipe().map_err(SessionError::Pipe)?;
        let (worker_in, outbound) = pipe().map_err(SessionError::Pipe)?;

        let memory: Arc<dyn AddressSpace> = Arc::new(HeapSpace);
        let scheduler = Arc::new(EmulatedScheduler::new());
        let rtprio = Arc::new(RtPrio::new(
            Arc::clone(&scheduler),
            Arc::clone(&memory),
            scheduler.clone(),
        ));

        let channel = Arc::new(CommandChannel::new());
        let mut builder =
            WorkerBuilder::new().name(config.worker.name.clone()).idle(config.worker.idle);
        if let Some(rtp) = config.worker.priority {
            builder = builder.priority(rtprio.clone(), rtp);
        }
        let handler = EmulatedWorker::new(Arc::clone(&kernel), worker_in, worker_out);
        let worker = builder.spawn(Arc::clone(&channel), handler)?;

        let parts = AccessorParts {
            inbound: Box::new(inbound),
            outbound: Box::new(outbound),
            redirect: Box::new(EmulatedRedirect::new(Arc::clone(&kernel))),
            memory,
            staging_size: config.accessor.scratch_size,
        };
        let accessor = KernelAccessor::new(channel, kernel.base(), parts)?;
        log::info!(
            "session: kernel image {} bytes at {}, worker `{}`",
            config.emulation.image_size,
            kernel.base(),
            config.worker.name
        );
        Ok(Self { accessor, worker, kernel, scheduler, rtprio })
    }

    /// The accessor.
    pub fn accessor(&mut self) -> &mut KernelAccessor {
        &mut self.accessor
    }

    /// The emulated kernel, for inspection.
    pub fn kernel(&self) -> &Arc<EmulatedKernel> {
        &self.kernel
    }

    /// The emulated scheduler table.
    pub fn scheduler(&self) -> &Arc<EmulatedScheduler> {
        &self.scheduler
    }

    /// Priority control bound to the emulated scheduler.
    pub fn rtprio(&self) -> &Arc<EmulatedRtPrio> {
        &self.rtprio
    }

    /// Frees the accessor, then stops and joins the worker.
    pub fn shutdown(self) -> Result<(), SessionError> {
        let Self { accessor, worker, .. } = self;
        accessor.free();
        worker.shutdown()?;
        log::info!("session: stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: KernelAddress = KernelAddress::new(0xffff_8000_0000_0000);

    #[test]
    fn pipe_moves_bytes() {
        let (mut reader, mut writer) = pipe().unwrap();
        assert_eq!(writer.write(b"kaccess").unwrap(), 7);
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"kaccess");
        drop(writer);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peek_and_poke_are_bounded() {
        let kernel = EmulatedKernel::new(BASE, 32);
        assert!(kernel.poke(KernelAddress::new(BASE.get() + 28), &[1, 2, 3, 4]));
        assert!(!kernel.poke(KernelAddress::new(BASE.get() + 29), &[1, 2, 3, 4]));
        assert!(kernel.peek(KernelAddress::new(BASE.get() - 1), 1).is_none());
        assert_eq!(kernel.peek(KernelAddress::new(BASE.get() + 30), 2).unwrap(), [3, 4]);
    }

    #[test]
    fn redirect_refuses_outside_image_and_on_demand() {
        let kernel = Arc::new(EmulatedKernel::new(BASE, 64));
        let mut redirect = EmulatedRedirect::new(Arc::clone(&kernel));
        assert!(redirect.swap(Direction::CopyIn, 0x1000, BASE, 8));
        assert!(!redirect.swap(Direction::CopyIn, 0x1000, KernelAddress::new(BASE.get() + 60), 8));
        kernel.fail_next_swaps(1);
        assert!(!redirect.swap(Direction::CopyOut, 0x1000, BASE, 8));
        assert!(redirect.swap(Direction::CopyOut, 0x1000, BASE, 8));
        assert_eq!(kernel.swap_attempts(), 4);
    }

    #[test]
    fn worker_rejects_mismatched_vector() {
        let kernel = Arc::new(EmulatedKernel::new(BASE, 64));
        let (from_accessor, mut accessor_out) = pipe().unwrap();
        let (_accessor_in, to_accessor) = pipe().unwrap();
        let mut worker = EmulatedWorker::new(Arc::clone(&kernel), from_accessor, to_accessor);
        kernel.redirect(Direction::CopyOut, BASE, 4);
        accessor_out.write_all(&[1, 2, 3, 4]).unwrap();
        let err = worker.transfer(Command::Write).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn released_worker_fails_transfers() {
        let kernel = Arc::new(EmulatedKernel::new(BASE, 64));
        let (from_accessor, _w) = pipe().unwrap();
        let (_r, to_accessor) = pipe().unwrap();
        let mut worker = EmulatedWorker::new(kernel, from_accessor, to_accessor);
        worker.release();
        assert_eq!(worker.transfer(Command::Read).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn scheduler_binds_each_thread() {
        let sched = Arc::new(EmulatedScheduler::new());
        let mut buf = [0u8; RTPRIO_SIZE];
        assert_eq!(sched.rtprio_thread(RTP_LOOKUP, LwpId::CURRENT, &mut buf), 0);
        let other = Arc::clone(&sched);
        thread::Builder::new()
            .name("rt-probe".into())
            .spawn(move || {
                let mut buf = RtPrioType::new(SchedulingClass::Fifo, 7).encode();
                assert_eq!(other.rtprio_thread(RTP_SET, LwpId::CURRENT, &mut buf), 0);
            })
            .unwrap()
            .join()
            .unwrap();
        let probe = sched.lwp_named("rt-probe").unwrap();
        let mut buf = [0u8; RTPRIO_SIZE];
        assert_eq!(sched.rtprio_thread(RTP_LOOKUP, probe, &mut buf), 0);
        assert_eq!(RtPrioType::decode(&buf).unwrap(), RtPrioType::new(SchedulingClass::Fifo, 7));
    }

    #[test]
    fn scheduler_errors_are_per_thread() {
        let sched = EmulatedScheduler::new();
        let mut buf = [0u8; 2];
        assert_eq!(sched.rtprio_thread(RTP_LOOKUP, LwpId::CURRENT, &mut buf), -1);
        assert_eq!(sched.last_error("probe").code(), libc::EFAULT);
        let code = thread::scope(|s| s.spawn(|| sched.last_error("probe").code()).join().unwrap());
        assert_eq!(code, 0);
    }
}
