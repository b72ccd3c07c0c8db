// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread real-time scheduling priority (`rtprio_thread(2)`).
//!
//! The record is marshalled through a scoped 4-byte scratch region; the platform error is
//! captured before that region is released.

use std::sync::Arc;

use kaccess_abi::rtprio::{
    DecodeError, RtPrioType, SchedulingClass, RTPRIO_SIZE, RTP_LOOKUP, RTP_SET,
};
use kaccess_abi::LwpId;

use crate::errno::{ErrorSource, OsError};
use crate::memory::{self, AddressSpace, Scratch};

/// Result alias for priority operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by priority operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform rejected the call.
    #[error(transparent)]
    Os(#[from] OsError),
    /// The platform returned a record this crate cannot represent.
    #[error("malformed rtprio record: {0}")]
    Abi(DecodeError),
    /// Scratch allocation failed.
    #[error(transparent)]
    Memory(#[from] memory::Error),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Self::Abi(err)
    }
}

/// Raw `rtprio_thread` entry point.
pub trait RtPrioSyscall: Send + Sync {
    /// Performs `function` (`RTP_LOOKUP`/`RTP_SET`) on `lwpid` with the record in `rtp`.
    ///
    /// Returns `-1` on failure and leaves the cause for the paired [`ErrorSource`].
    fn rtprio_thread(&self, function: i32, lwpid: LwpId, rtp: &mut [u8]) -> i32;
}

impl<T: RtPrioSyscall + ?Sized> RtPrioSyscall for Arc<T> {
    fn rtprio_thread(&self, function: i32, lwpid: LwpId, rtp: &mut [u8]) -> i32 {
        (**self).rtprio_thread(function, lwpid, rtp)
    }
}

/// Object-safe view of priority control, used by the worker to raise itself.
pub trait PriorityControl: Send + Sync {
    /// Current record of `lwpid`.
    fn lookup_rt_prio(&self, lwpid: LwpId) -> Result<RtPrioType>;

    /// Replaces the record of `lwpid`.
    fn set_rt_prio(&self, lwpid: LwpId, rtp: RtPrioType) -> Result<()>;
}

/// Priority control over a syscall backend.
pub struct RtPrio<S> {
    syscalls: S,
    memory: Arc<dyn AddressSpace>,
    errors: Arc<dyn ErrorSource>,
}

impl<S: RtPrioSyscall> RtPrio<S> {
    /// Binds a backend, the memory for scratch records and the matching error source.
    pub fn new(syscalls: S, memory: Arc<dyn AddressSpace>, errors: Arc<dyn ErrorSource>) -> Self {
        Self { syscalls, memory, errors }
    }

    /// Queries the scheduling record of `lwpid` ([`LwpId::CURRENT`] for the caller).
    pub fn lookup_rt_prio(&self, lwpid: LwpId) -> Result<RtPrioType> {
        let mut record = Scratch::alloc(&self.memory, RTPRIO_SIZE)?;
        if self.syscalls.rtprio_thread(RTP_LOOKUP, lwpid, record.as_mut_slice()) == -1 {
            return Err(self.errors.last_error("RtPrio::lookup_rt_prio").into());
        }
        let raw_class = record.read_u16(0);
        let class =
            SchedulingClass::from_raw(raw_class).ok_or(DecodeError::UnknownClass(raw_class))?;
        Ok(RtPrioType::new(class, record.read_u16(2)))
    }

    /// Sets the scheduling record of `lwpid`.
    pub fn set_rt_prio(&self, lwpid: LwpId, rtp: RtPrioType) -> Result<()> {
        let mut record = Scratch::alloc(&self.memory, RTPRIO_SIZE)?;
        record.write_u16(0, rtp.class().value());
        record.write_u16(2, rtp.priority());
        if self.syscalls.rtprio_thread(RTP_SET, lwpid, record.as_mut_slice()) == -1 {
            return Err(self.errors.last_error("RtPrio::set_rt_prio").into());
        }
        log::debug!("rtprio: lwp {lwpid} set to {rtp}");
        Ok(())
    }
}

impl<S: RtPrioSyscall> PriorityControl for RtPrio<S> {
    fn lookup_rt_prio(&self, lwpid: LwpId) -> Result<RtPrioType> {
        RtPrio::lookup_rt_prio(self, lwpid)
    }

    fn set_rt_prio(&self, lwpid: LwpId, rtp: RtPrioType) -> Result<()> {
        RtPrio::set_rt_prio(self, lwpid, rtp)
    }
}

/// Native backend.
#[cfg(target_os = "freebsd")]
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeBsdRtPrio;

#[cfg(target_os = "freebsd")]
impl RtPrioSyscall for FreeBsdRtPrio {
    fn rtprio_thread(&self, function: i32, lwpid: LwpId, rtp: &mut [u8]) -> i32 {
        let misaligned = rtp.as_ptr() as usize % core::mem::align_of::<libc::rtprio>() != 0;
        if rtp.len() < RTPRIO_SIZE || misaligned {
            // SAFETY: `__error` returns the calling thread's errno slot.
            unsafe { *libc::__error() = libc::EFAULT };
            return -1;
        }
        // SAFETY: `rtp` is large enough and suitably aligned for `struct rtprio` (two u16).
        unsafe { libc::rtprio_thread(function, lwpid.0 as libc::lwpid_t, rtp.as_mut_ptr().cast()) }
    }
}

/// Priority control bound to the native backend, heap scratch and `errno`.
#[cfg(target_os = "freebsd")]
pub fn native() -> RtPrio<FreeBsdRtPrio> {
    RtPrio::new(
        FreeBsdRtPrio,
        Arc::new(memory::HeapSpace),
        Arc::new(crate::errno::HostErrno),
    )
}

#[cfg(all(test, target_os = "freebsd"))]
mod native_tests {
    use super::*;
    use crate::errno::HostErrno;

    #[test]
    fn short_record_is_efault() {
        let mut rtp = [0u8; 2];
        assert_eq!(FreeBsdRtPrio.rtprio_thread(RTP_LOOKUP, LwpId::CURRENT, &mut rtp), -1);
        assert_eq!(HostErrno.last_error("rtprio_thread").code(), libc::EFAULT);
    }

    #[test]
    fn current_thread_lookup_succeeds() {
        let rtp = native().lookup_rt_prio(LwpId::CURRENT).unwrap();
        assert!(rtp.priority() <= kaccess_abi::rtprio::RTP_PRIO_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::EmulatedScheduler;
    use crate::memory::{CountingSpace, HeapSpace};
    use proptest::prelude::*;

    fn rig() -> (RtPrio<Arc<EmulatedScheduler>>, Arc<CountingSpace<HeapSpace>>) {
        let sched = Arc::new(EmulatedScheduler::new());
        let space = Arc::new(CountingSpace::new(HeapSpace));
        let rtprio = RtPrio::new(Arc::clone(&sched), space.clone(), sched);
        (rtprio, space)
    }

    #[test]
    fn fresh_thread_is_normal() {
        let (rtprio, _) = rig();
        let rtp = rtprio.lookup_rt_prio(LwpId::CURRENT).unwrap();
        assert_eq!(rtp, RtPrioType::new(SchedulingClass::Normal, 0));
    }

    #[test]
    fn unknown_thread_carries_os_code_and_releases_scratch() {
        let (rtprio, space) = rig();
        let err = rtprio.lookup_rt_prio(LwpId(4242)).unwrap_err();
        let Error::Os(os) = &err else { panic!("expected OS error, got {err:?}") };
        assert_eq!(os.code(), libc::ESRCH);
        assert_eq!(os.context(), "RtPrio::lookup_rt_prio");
        assert_eq!(space.allocations(), 1);
        assert_eq!(space.outstanding(), 0);
    }

    #[test]
    fn out_of_range_priority_rejected() {
        let (rtprio, space) = rig();
        let err = rtprio
            .set_rt_prio(LwpId::CURRENT, RtPrioType::new(SchedulingClass::Realtime, 99))
            .unwrap_err();
        assert!(matches!(&err, Error::Os(os) if os.code() == libc::EINVAL));
        assert!(err.to_string().starts_with("RtPrio::set_rt_prio: EINVAL"));
        assert_eq!(space.outstanding(), 0);
    }

    #[test]
    fn usable_through_trait_object() {
        let (rtprio, _) = rig();
        let control: Arc<dyn PriorityControl> = Arc::new(rtprio);
        let rtp = RtPrioType::new(SchedulingClass::Idle, 3);
        control.set_rt_prio(LwpId::CURRENT, rtp).unwrap();
        assert_eq!(control.lookup_rt_prio(LwpId::CURRENT).unwrap(), rtp);
    }

    proptest! {
        #[test]
        fn set_then_lookup_returns_record(
            class in proptest::sample::select(SchedulingClass::ALL.to_vec()),
            priority in 0u16..=31,
        ) {
            let (rtprio, space) = rig();
            let rtp = RtPrioType::new(class, priority);
            rtprio.set_rt_prio(LwpId::CURRENT, rtp).unwrap();
            prop_assert_eq!(rtprio.lookup_rt_prio(LwpId::CURRENT).unwrap(), rtp);
            prop_assert_eq!(space.outstanding(), 0);
        }
    }
}
