// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation of the last platform error into a structured failure.

use std::fmt;
use std::io;

/// Platform error code captured right after a failed call, tagged with where it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsError {
    context: String,
    code: i32,
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (errno {})", self.context, self.name(), self.code)
    }
}

impl std::error::Error for OsError {}

impl OsError {
    /// Creates an error for `code` raised by `context`.
    pub fn new(context: impl Into<String>, code: i32) -> Self {
        Self { context: context.into(), code }
    }

    /// Wraps an I/O error; errors without an OS code map to `EIO`.
    pub fn from_io(context: impl Into<String>, err: &io::Error) -> Self {
        Self::new(context, err.raw_os_error().unwrap_or(libc::EIO))
    }

    /// Raw platform error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Label of the operation that failed.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Symbolic name of the code, e.g. `ESRCH`.
    pub fn name(&self) -> Name {
        Name(self.code)
    }
}

/// Symbolic errno name, displayed as e.g. `EPERM` or `E#1234` when unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Name(i32);

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match errno_name(self.0) {
            "" => write!(f, "E#{}", self.0),
            name => f.write_str(name),
        }
    }
}

fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::ESRCH => "ESRCH",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::EBUSY => "EBUSY",
        libc::EINVAL => "EINVAL",
        libc::EPIPE => "EPIPE",
        libc::ENOSYS => "ENOSYS",
        _ => "",
    }
}

/// Source of the "last error" of the calling thread.
pub trait ErrorSource: Send + Sync {
    /// Captures the last error and labels it with `context`.
    fn last_error(&self, context: &str) -> OsError;
}

/// Reads the calling thread's `errno`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostErrno;

impl ErrorSource for HostErrno {
    fn last_error(&self, context: &str) -> OsError {
        OsError::from_io(context, &io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_code() {
        let err = OsError::new("RtPrio::lookup_rt_prio", libc::ESRCH);
        let text = err.to_string();
        assert!(text.starts_with("RtPrio::lookup_rt_prio: ESRCH"), "{text}");
        assert!(text.contains(&format!("errno {}", libc::ESRCH)));
        assert_eq!(err.name().to_string(), "ESRCH");
    }

    #[test]
    fn unknown_codes_still_render() {
        assert_eq!(Name(9999).to_string(), "E#9999");
    }

    #[test]
    fn io_errors_without_code_become_eio() {
        let err = OsError::from_io("pipe", &io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), libc::EIO);
    }
}
