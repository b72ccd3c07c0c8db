// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel read/write primitives built on a single privileged worker thread.
//!
//! A caller arms the [`command::CommandChannel`], redirects the worker's pending I/O vector
//! through an [`accessor::IovRedirect`], then moves bytes over a pair of streams. The
//! [`host`] module provides a complete in-process backend so the whole path runs without the
//! target kernel.

#![deny(clippy::all, missing_docs)]

pub mod accessor;
pub mod command;
pub mod config;
pub mod errno;
pub mod host;
pub mod memory;
pub mod rtprio;

pub use accessor::{AccessorParts, IovRedirect, KernelAccessor};
pub use command::{CommandChannel, IdlePolicy, Privileged, WorkerBuilder, WorkerHandle};
pub use config::Config;
pub use errno::{ErrorSource, OsError};
pub use kaccess_abi::rtprio::{RtPrioType, SchedulingClass};
pub use kaccess_abi::{Command, Direction, KernelAddress, LwpId, Width};
pub use memory::{AddressSpace, Scratch};
pub use rtprio::{PriorityControl, RtPrio};
