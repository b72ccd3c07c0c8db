// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single-slot command channel between requesters and the privileged worker
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host)
//!
//! PUBLIC API:
//!   - CommandChannel: command slot + wait/notify rendezvous
//!   - Interrupter: wakes a requester blocked in `await_idle`
//!   - Privileged: worker-side transfer handler
//!   - WorkerBuilder / WorkerHandle: privileged worker thread lifecycle
//!   - IdlePolicy: how the worker polls an idle slot
//!
//! INVARIANTS:
//!   - The slot only ever holds a `Command` code
//!   - Every slot transition happens under `lock`; lock-free loads are for polling only
//!   - A request on a non-idle slot fails immediately with `Busy`
//!   - No other lock is taken while `lock` is held

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use kaccess_abi::rtprio::RtPrioType;
use kaccess_abi::{Command, LwpId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;

use crate::rtprio::PriorityControl;

/// Result alias for channel operations.
pub type Result<T> = core::result::Result<T, ChannelError>;

/// Errors produced by the command channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Another command is still in flight.
    #[error("command slot busy: {current}")]
    Busy {
        /// Code occupying the slot.
        current: Command,
    },
    /// `Idle` is a state, not a request.
    #[error("cannot request {0}")]
    InvalidRequest(Command),
    /// The requester was interrupted while waiting.
    #[error("interrupted while waiting for the privileged worker")]
    Interrupted,
    /// The channel was shut down; the worker will not reset the slot again.
    #[error("command channel shut down")]
    Closed,
    /// The worker thread panicked.
    #[error("privileged worker panicked")]
    WorkerPanicked,
    /// The worker thread could not be started.
    #[error("failed to spawn privileged worker")]
    Spawn(#[source] io::Error),
}

/// Command slot shared by requesters and exactly one privileged worker.
#[derive(Debug)]
pub struct CommandChannel {
    slot: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
    interrupted: AtomicBool,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    /// Creates an idle channel.
    pub fn new() -> Self {
        Self {
            slot: AtomicU8::new(Command::Idle.as_raw()),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Lock-free load of the slot.
    pub fn current(&self) -> Command {
        let raw = self.slot.load(Ordering::Acquire);
        match Command::from_raw(raw) {
            Some(command) => command,
            None => unreachable!("command slot holds {raw:#x}"),
        }
    }

    fn store(&self, _guard: &MutexGuard<'_, ()>, command: Command) {
        self.slot.store(command.as_raw(), Ordering::Release);
    }

    /// Arms the slot with `code` and wakes the worker.
    ///
    /// Fails with [`ChannelError::Busy`] without blocking if a command is in flight.
    pub fn request_operation(&self, code: Command) -> Result<()> {
        if code == Command::Idle {
            return Err(ChannelError::InvalidRequest(code));
        }
        let guard = self.lock.lock();
        let current = self.current();
        if current != Command::Idle {
            return Err(ChannelError::Busy { current });
        }
        self.store(&guard, code);
        log::debug!("command: idle -> {code}");
        self.cond.notify_all();
        Ok(())
    }

    /// Asks the worker to release its resources and exit.
    pub fn request_shutdown(&self) -> Result<()> {
        self.request_operation(Command::Shutdown)
    }

    /// Blocks until the slot returns to idle.
    ///
    /// A pending interrupt is consumed and reported as [`ChannelError::Interrupted`]; the caller
    /// decides whether to restore it with [`CommandChannel::interrupt`].
    pub fn await_idle(&self) -> Result<()> {
        let mut guard = self.lock.lock();
        loop {
            match self.current() {
                Command::Idle => return Ok(()),
                current if !current.is_transfer() => return Err(ChannelError::Closed),
                _ => {}
            }
            if self.interrupted.swap(false, Ordering::AcqRel) {
                return Err(ChannelError::Interrupted);
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Resets the slot to idle and wakes every waiter. Worker side only.
    fn complete(&self, finished: Command) {
        let guard = self.lock.lock();
        self.store(&guard, Command::Idle);
        log::debug!("command: {finished} -> idle");
        self.cond.notify_all();
    }

    /// Parks the worker until the slot holds something other than idle.
    fn wait_for_command(&self) -> Command {
        let mut guard = self.lock.lock();
        loop {
            let current = self.current();
            if current != Command::Idle {
                return current;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Sets the interrupt flag and wakes any requester blocked in [`CommandChannel::await_idle`].
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Returns `true` if an interrupt is pending.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Clears the interrupt flag, returning whether it was set.
    pub fn clear_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Handle that can interrupt waiters from another thread.
    pub fn interrupter(self: &Arc<Self>) -> Interrupter {
        Interrupter { channel: Arc::clone(self) }
    }
}

/// Cloneable handle interrupting requesters blocked on a channel.
#[derive(Clone, Debug)]
pub struct Interrupter {
    channel: Arc<CommandChannel>,
}

impl Interrupter {
    /// See [`CommandChannel::interrupt`].
    pub fn interrupt(&self) {
        self.channel.interrupt();
    }
}

/// Worker-side half of a transfer.
pub trait Privileged: Send {
    /// Performs the privileged part of `command` (`Read` or `Write`).
    fn transfer(&mut self, command: Command) -> io::Result<()>;

    /// Releases native resources; called once when `Shutdown` is observed.
    fn release(&mut self);
}

/// How the worker waits while the slot is idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    /// Busy-spin with a CPU relax hint.
    Spin,
    /// Yield the CPU between polls.
    #[default]
    Yield,
    /// Block on the channel condition variable.
    Park,
}

/// Runs the worker loop on the calling thread until `Shutdown` is observed.
pub fn run_worker<P: Privileged + ?Sized>(
    channel: &CommandChannel,
    handler: &mut P,
    idle: IdlePolicy,
) {
    loop {
        let current = match idle {
            IdlePolicy::Park => channel.wait_for_command(),
            IdlePolicy::Spin | IdlePolicy::Yield => channel.current(),
        };
        match current {
            Command::Idle => {
                if idle == IdlePolicy::Spin {
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            Command::Shutdown => {
                handler.release();
                log::info!("worker: shutdown observed, resources released");
                return;
            }
            Command::Read | Command::Write => {
                if let Err(err) = handler.transfer(current) {
                    log::error!("worker: {current} transfer failed: {err}");
                }
                channel.complete(current);
            }
        }
    }
}

/// Configures and starts the privileged worker thread.
pub struct WorkerBuilder {
    name: String,
    idle: IdlePolicy,
    priority: Option<(Arc<dyn PriorityControl>, RtPrioType)>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    /// Default thread name.
    pub const DEFAULT_NAME: &'static str = "kaccess-worker";

    /// Builder with the default name and [`IdlePolicy::Yield`].
    pub fn new() -> Self {
        Self { name: Self::DEFAULT_NAME.to_string(), idle: IdlePolicy::default(), priority: None }
    }

    /// Thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Idle polling policy.
    pub fn idle(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    /// Scheduling record the worker applies to itself before serving commands.
    pub fn priority(mut self, control: Arc<dyn PriorityControl>, rtp: RtPrioType) -> Self {
        self.priority = Some((control, rtp));
        self
    }

    /// Spawns the worker serving `channel` with `handler`.
    pub fn spawn<P>(self, channel: Arc<CommandChannel>, mut handler: P) -> Result<WorkerHandle>
    where
        P: Privileged + 'static,
    {
        let Self { name, idle, priority } = self;
        let served = Arc::clone(&channel);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some((control, rtp)) = priority {
                    match control.set_rt_prio(LwpId::CURRENT, rtp) {
                        Ok(()) => log::info!("worker: running at {rtp}"),
                        Err(err) => log::warn!("worker: could not apply {rtp}: {err}"),
                    }
                }
                log::info!("worker: serving commands ({idle:?})");
                run_worker(&served, &mut handler, idle);
            })
            .map_err(ChannelError::Spawn)?;
        log::debug!("worker: spawned {name}");
        Ok(WorkerHandle { channel, thread: Some(thread) })
    }
}

/// Owns the privileged worker thread; shuts it down on drop.
#[derive(Debug)]
pub struct WorkerHandle {
    channel: Arc<CommandChannel>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Channel served by this worker.
    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Waits for the in-flight command, requests shutdown and joins the thread.
    ///
    /// Interrupts do not abandon the worker: the wait continues and the flag is restored once
    /// the thread has been joined.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.as_ref() else {
            return Ok(());
        };
        let mut interrupted = false;
        let closed = loop {
            match self.channel.await_idle() {
                Ok(()) => break false,
                Err(ChannelError::Closed) => break true,
                // A worker that died mid-transfer never resets the slot.
                Err(ChannelError::Interrupted) if thread.is_finished() => {
                    interrupted = true;
                    break true;
                }
                Err(ChannelError::Interrupted) => interrupted = true,
                Err(err) => return Err(err),
            }
        };
        let requested = if closed { Ok(()) } else { self.channel.request_shutdown() };
        let joined = match requested {
            Ok(()) => self.thread.take().map_or(Ok(()), |thread| {
                thread.join().map_err(|_| ChannelError::WorkerPanicked)
            }),
            Err(err) => Err(err),
        };
        if interrupted {
            self.channel.interrupt();
        }
        joined
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("worker: shutdown on drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Barrier};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Command>>>,
        released: Arc<AtomicBool>,
        fail: bool,
    }

    impl Privileged for Recorder {
        fn transfer(&mut self, command: Command) -> io::Result<()> {
            self.seen.lock().push(command);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn second_request_fails_without_blocking() {
        let channel = CommandChannel::new();
        channel.request_operation(Command::Write).unwrap();
        let err = channel.request_operation(Command::Read).unwrap_err();
        assert!(matches!(err, ChannelError::Busy { current: Command::Write }));
        assert_eq!(channel.current(), Command::Write);
    }

    #[test]
    fn idle_is_not_a_request() {
        let channel = CommandChannel::new();
        let err = channel.request_operation(Command::Idle).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidRequest(Command::Idle)));
    }

    #[test]
    fn await_idle_returns_immediately_when_idle() {
        CommandChannel::new().await_idle().unwrap();
    }

    #[test]
    fn every_policy_serves_and_shuts_down() {
        for idle in [IdlePolicy::Spin, IdlePolicy::Yield, IdlePolicy::Park] {
            let channel = Arc::new(CommandChannel::new());
            let recorder = Recorder::default();
            let seen = Arc::clone(&recorder.seen);
            let released = Arc::clone(&recorder.released);
            let worker = WorkerBuilder::new()
                .idle(idle)
                .spawn(Arc::clone(&channel), recorder)
                .unwrap();

            for code in [Command::Write, Command::Read, Command::Write] {
                channel.request_operation(code).unwrap();
                channel.await_idle().unwrap();
            }
            worker.shutdown().unwrap();

            assert_eq!(*seen.lock(), vec![Command::Write, Command::Read, Command::Write]);
            assert!(released.load(Ordering::SeqCst), "{idle:?}");
            assert_eq!(channel.current(), Command::Shutdown);
            assert!(matches!(channel.await_idle(), Err(ChannelError::Closed)));
        }
    }

    #[test]
    fn failed_transfer_still_resets_slot() {
        let channel = Arc::new(CommandChannel::new());
        let recorder = Recorder { fail: true, ..Recorder::default() };
        let worker = WorkerBuilder::new()
            .idle(IdlePolicy::Park)
            .spawn(Arc::clone(&channel), recorder)
            .unwrap();
        channel.request_operation(Command::Write).unwrap();
        channel.await_idle().unwrap();
        assert_eq!(channel.current(), Command::Idle);
        worker.shutdown().unwrap();
    }

    #[test]
    fn interrupt_wakes_waiter_and_is_consumed() {
        let channel = Arc::new(CommandChannel::new());
        // No worker: the slot stays armed until someone interrupts.
        channel.request_operation(Command::Read).unwrap();
        let interrupter = channel.interrupter();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                tx.send(()).unwrap();
                channel.await_idle()
            })
        };
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ChannelError::Interrupted)));
        assert!(!channel.is_interrupted());
    }

    #[test]
    fn pending_interrupt_fails_next_wait() {
        let channel = CommandChannel::new();
        channel.request_operation(Command::Write).unwrap();
        channel.interrupt();
        assert!(channel.is_interrupted());
        assert!(matches!(channel.await_idle(), Err(ChannelError::Interrupted)));
        channel.interrupt();
        assert!(channel.clear_interrupt());
        assert!(!channel.clear_interrupt());
    }

    struct Gate {
        barrier: Arc<Barrier>,
        released: Arc<AtomicBool>,
    }

    impl Privileged for Gate {
        fn transfer(&mut self, _command: Command) -> io::Result<()> {
            self.barrier.wait();
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn interrupted_shutdown_still_joins_and_releases() {
        let channel = Arc::new(CommandChannel::new());
        let barrier = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));
        let gate = Gate { barrier: Arc::clone(&barrier), released: Arc::clone(&released) };
        let worker = WorkerBuilder::new()
            .idle(IdlePolicy::Park)
            .spawn(Arc::clone(&channel), gate)
            .unwrap();

        // The worker is held inside the transfer until the opener passes the barrier.
        channel.request_operation(Command::Write).unwrap();
        channel.interrupt();
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            barrier.wait();
        });
        worker.shutdown().unwrap();
        opener.join().unwrap();

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(channel.current(), Command::Shutdown);
        assert!(channel.is_interrupted());
    }

    #[test]
    fn drop_joins_worker() {
        let channel = Arc::new(CommandChannel::new());
        let recorder = Recorder::default();
        let released = Arc::clone(&recorder.released);
        drop(WorkerBuilder::new().name("drop-test").spawn(Arc::clone(&channel), recorder).unwrap());
        assert!(released.load(Ordering::SeqCst));
    }
}
