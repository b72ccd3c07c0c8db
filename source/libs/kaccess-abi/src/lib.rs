// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared definitions between kernel-accessor requesters and the privileged worker
//! OWNERS: @runtime
//! PUBLIC API: Command, Direction, Width, KernelAddress, LwpId, rtprio::{RtPrioType, SchedulingClass}
//! DEPENDS_ON: core only
//! INVARIANTS: Command slot codes are 0..=3; rtprio records are 4 bytes LE (class, priority)

use core::fmt;

/// Operation code stored in the command slot shared with the privileged worker.
///
/// The slot never holds a value outside this enum: every store goes through
/// [`Command::as_raw`] and every load through [`Command::from_raw`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// No operation in flight.
    Idle = 0,
    /// Requester is draining bytes the worker pushes out of kernel memory.
    Read = 1,
    /// Requester is feeding bytes the worker lands in kernel memory.
    Write = 2,
    /// Worker must release its resources and exit.
    Shutdown = 3,
}

impl Command {
    /// Decodes a raw slot value.
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Raw slot value.
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Returns `true` for codes that move bytes across the privilege boundary.
    pub const fn is_transfer(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Read => "read-requested",
            Self::Write => "write-requested",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Direction of a transfer relative to kernel memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// User buffer into kernel memory.
    CopyIn,
    /// Kernel memory into user buffer.
    CopyOut,
}

impl Direction {
    /// Command code that arms the worker for this direction.
    pub const fn command(self) -> Command {
        match self {
            Self::CopyIn => Command::Write,
            Self::CopyOut => Command::Read,
        }
    }
}

/// Fixed transfer widths supported by the typed accessors.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    /// One byte.
    Byte = 1,
    /// Two bytes.
    Word = 2,
    /// Four bytes.
    Dword = 4,
    /// Eight bytes.
    Qword = 8,
}

impl Width {
    /// Width in bytes.
    pub const fn bytes(self) -> usize {
        self as usize
    }
}

/// Address in the kernel's virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelAddress(u64);

impl KernelAddress {
    /// Wraps a raw kernel virtual address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw address value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Address `offset` bytes further, or `None` on overflow.
    pub const fn offset(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl From<u64> for KernelAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for KernelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for KernelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Lightweight (kernel) thread identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LwpId(pub i32);

impl LwpId {
    /// Refers to the calling thread in `rtprio_thread`.
    pub const CURRENT: Self = Self(0);
}

impl fmt::Display for LwpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lwp:{}", self.0)
    }
}

/// `include/sys/rtprio.h` definitions.
pub mod rtprio {
    use core::fmt;

    /// `rtprio_thread` function: read the current record.
    pub const RTP_LOOKUP: i32 = 0;
    /// `rtprio_thread` function: replace the record.
    pub const RTP_SET: i32 = 1;

    /// Highest (least urgent) priority level.
    pub const RTP_PRIO_MAX: u16 = 31;

    /// Bit that turns a realtime class into its FIFO variant.
    pub const RTP_PRIO_FIFO_BIT: u16 = 8;

    /// Size of the encoded `struct rtprio`.
    pub const RTPRIO_SIZE: usize = 4;

    /// Scheduling class carried in the first half of `struct rtprio`.
    #[repr(u16)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum SchedulingClass {
        /// Interrupt thread class.
        InterruptThread = 1,
        /// Round-robin realtime.
        Realtime = 2,
        /// Time-sharing.
        Normal = 3,
        /// Runs only when nothing else is runnable.
        Idle = 4,
        /// FIFO realtime.
        Fifo = 2 | RTP_PRIO_FIFO_BIT,
    }

    impl SchedulingClass {
        /// Every class, in declaration order.
        pub const ALL: [Self; 5] =
            [Self::InterruptThread, Self::Realtime, Self::Normal, Self::Idle, Self::Fifo];

        /// Decodes a raw class value.
        pub const fn from_raw(raw: u16) -> Option<Self> {
            match raw {
                1 => Some(Self::InterruptThread),
                2 => Some(Self::Realtime),
                3 => Some(Self::Normal),
                4 => Some(Self::Idle),
                10 => Some(Self::Fifo),
                _ => None,
            }
        }

        /// Raw class value.
        pub const fn value(self) -> u16 {
            self as u16
        }
    }

    /// Errors produced when decoding a `struct rtprio`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum DecodeError {
        /// Buffer shorter than [`RTPRIO_SIZE`].
        Truncated {
            /// Length of the supplied buffer.
            len: usize,
        },
        /// Class field did not match any [`SchedulingClass`].
        UnknownClass(u16),
    }

    impl fmt::Display for DecodeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Truncated { len } => {
                    write!(f, "rtprio buffer truncated: {len} < {RTPRIO_SIZE} bytes")
                }
                Self::UnknownClass(raw) => write!(f, "unknown scheduling class {raw}"),
            }
        }
    }

    /// Scheduling class plus priority level of one thread.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RtPrioType {
        class: SchedulingClass,
        priority: u16,
    }

    impl RtPrioType {
        /// Creates a record.
        pub const fn new(class: SchedulingClass, priority: u16) -> Self {
            Self { class, priority }
        }

        /// Scheduling class.
        pub const fn class(&self) -> SchedulingClass {
            self.class
        }

        /// Priority level within the class.
        pub const fn priority(&self) -> u16 {
            self.priority
        }

        /// Encodes as `struct rtprio` (class in bytes 0..2, priority in bytes 2..4).
        pub fn encode(&self) -> [u8; RTPRIO_SIZE] {
            let mut out = [0u8; RTPRIO_SIZE];
            out[..2].copy_from_slice(&self.class.value().to_le_bytes());
            out[2..].copy_from_slice(&self.priority.to_le_bytes());
            out
        }

        /// Decodes a `struct rtprio`; trailing bytes are ignored.
        pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
            if buf.len() < RTPRIO_SIZE {
                return Err(DecodeError::Truncated { len: buf.len() });
            }
            let raw_class = u16::from_le_bytes([buf[0], buf[1]]);
            let priority = u16::from_le_bytes([buf[2], buf[3]]);
            let class =
                SchedulingClass::from_raw(raw_class).ok_or(DecodeError::UnknownClass(raw_class))?;
            Ok(Self { class, priority })
        }
    }

    impl fmt::Display for RtPrioType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}/{}", self.class, self.priority)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::rtprio::{DecodeError, RtPrioType, SchedulingClass};
    use super::*;

    #[test]
    fn command_codes_are_closed() {
        for raw in 0u8..=u8::MAX {
            match Command::from_raw(raw) {
                Some(cmd) => assert_eq!(cmd.as_raw(), raw),
                None => assert!(raw > 3),
            }
        }
    }

    #[test]
    fn direction_maps_to_command() {
        assert_eq!(Direction::CopyIn.command(), Command::Write);
        assert_eq!(Direction::CopyOut.command(), Command::Read);
        assert!(Command::Read.is_transfer());
        assert!(!Command::Shutdown.is_transfer());
    }

    #[test]
    fn rtprio_layout_is_class_then_priority() {
        let rtp = RtPrioType::new(SchedulingClass::Fifo, 0x0102);
        assert_eq!(rtp.encode(), [10, 0, 0x02, 0x01]);
    }

    #[test]
    fn rtprio_rejects_unknown_class() {
        assert_eq!(RtPrioType::decode(&[7, 0, 0, 0]), Err(DecodeError::UnknownClass(7)));
        assert_eq!(RtPrioType::decode(&[2, 0]), Err(DecodeError::Truncated { len: 2 }));
    }

    #[test]
    fn kernel_address_offset_overflows_to_none() {
        let addr = KernelAddress::new(u64::MAX - 1);
        assert_eq!(addr.offset(1), Some(KernelAddress::new(u64::MAX)));
        assert_eq!(addr.offset(2), None);
    }
}
