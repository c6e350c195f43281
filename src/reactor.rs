//! Readiness reactor.
//!
//! One loop thread owns a `mio::Poll`. Tasks on any thread queue their
//! registrations and kick the loop through a `mio::Waker` (eventfd or a
//! self-pipe, depending on the platform); the loop installs them between two
//! polls, so the multiplexer is only ever touched from its own thread.
//! Callbacks run on the loop thread, one at a time, in the order the poller
//! reports events.
//!
//! Several registrations may watch the same descriptor; the loop keeps the
//! union of their interests installed and fires each callback only for the
//! readiness it asked for. Readiness is edge-triggered: persistent callbacks
//! must drain their channel until `WouldBlock`. Transient waits re-arm the
//! descriptor on every install, which reports the current state again.

use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// Readiness a registration is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b010);
    /// Completion of a non-blocking connect; reported as writability.
    pub const CONNECT: Interest = Interest(0b100);

    fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    fn wants_read(self) -> bool {
        self.contains(Self::READ)
    }

    fn wants_write(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::CONNECT)
    }

    fn to_mio(self) -> mio::Interest {
        match (self.wants_read(), self.wants_write()) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Readiness reported for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    readable: bool,
    writable: bool,
    error: bool,
}

impl Ready {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Socket-level error; delivered to every registration on the descriptor.
    pub fn is_error(&self) -> bool {
        self.error
    }

    fn satisfies(self, interest: Interest) -> bool {
        self.error
            || (interest.wants_read() && self.readable)
            || (interest.wants_write() && self.writable)
    }
}

/// Handle to a persistent registration, used to drop it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    token: u64,
}

type Callback = Box<dyn FnMut(Ready) + Send>;

struct Registration {
    // Keeps the descriptor open while it sits in the poller.
    channel: Arc<dyn AsRawFd + Send + Sync>,
    interest: Interest,
    transient: bool,
    callback: Callback,
}

enum Command {
    Register {
        token: u64,
        registration: Registration,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Cancel(u64),
}

struct Shared {
    running: AtomicBool,
    next_token: AtomicU64,
    commands: mpsc::Sender<Command>,
    waker: Waker,
}

impl Shared {
    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, command: Command) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        self.commands.send(command).map_err(|_| Error::Cancelled)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Readiness event loop running on a dedicated thread.
pub struct Reactor {
    shared: Arc<Shared>,
    done: watch::Receiver<bool>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (commands_tx, commands_rx) = mpsc::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            next_token: AtomicU64::new(1),
            commands: commands_tx,
            waker,
        });

        let event_loop = EventLoop {
            poll,
            commands: commands_rx,
            shared: Arc::clone(&shared),
            registrations: HashMap::new(),
            fds: HashMap::new(),
            done: done_tx,
        };
        thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || event_loop.run())?;

        Ok(Self {
            shared,
            done: done_rx,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Installs a persistent callback for `interest` on `channel`.
    ///
    /// Resolves once the loop has installed the registration. The callback
    /// runs on the loop thread and must not block. Fails with
    /// [`Error::Cancelled`] once the reactor is shut down.
    pub async fn register<C, F>(
        &self,
        channel: Arc<C>,
        interest: Interest,
        on_ready: F,
    ) -> Result<EventHandle>
    where
        C: AsRawFd + Send + Sync + 'static,
        F: FnMut(Ready) + Send + 'static,
    {
        let token = self.shared.next_token();
        self.install(token, channel, interest, false, Box::new(on_ready))
            .await?;
        Ok(EventHandle { token })
    }

    pub fn deregister(&self, handle: EventHandle) {
        let _ = self.shared.submit(Command::Cancel(handle.token));
    }

    /// Suspends until `channel` is ready for `interest`, then drops the interest.
    ///
    /// Dropping the returned future before it resolves removes the pending
    /// registration. Fails with [`Error::Cancelled`] when the reactor shuts
    /// down first.
    pub async fn wait<C>(&self, channel: &Arc<C>, interest: Interest) -> Result<Ready>
    where
        C: AsRawFd + Send + Sync + 'static,
    {
        let token = self.shared.next_token();
        let mut pending = PendingWait {
            shared: &self.shared,
            token,
            armed: true,
        };
        let (tx, fired) = oneshot::channel();
        let mut tx = Some(tx);
        let callback = Box::new(move |ready: Ready| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(ready);
            }
        });

        let channel: Arc<C> = Arc::clone(channel);
        self.install(token, channel, interest, true, callback)
            .await?;
        let ready = fired.await.map_err(|_| Error::Cancelled)?;
        pending.armed = false;
        Ok(ready)
    }

    async fn install(
        &self,
        token: u64,
        channel: Arc<dyn AsRawFd + Send + Sync>,
        interest: Interest,
        transient: bool,
        callback: Callback,
    ) -> Result<()> {
        let (ack, installed) = oneshot::channel();
        self.shared.submit(Command::Register {
            token,
            registration: Registration {
                channel,
                interest,
                transient,
                callback,
            },
            ack,
        })?;
        match installed.await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Stops the loop; idempotent and non-blocking.
    pub fn close(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.shared.waker.wake() {
                warn!(target = "reactor", error = %err, "failed to wake reactor for shutdown");
            }
        }
    }

    /// Stops the loop and waits until it has released every registered channel.
    pub async fn shutdown(&self) {
        self.close();
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

struct PendingWait<'a> {
    shared: &'a Shared,
    token: u64,
    armed: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.shared.submit(Command::Cancel(self.token));
        }
    }
}

struct EventLoop {
    poll: Poll,
    commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    registrations: HashMap<u64, Registration>,
    // Registrations per descriptor; the mio token of a descriptor is the fd itself.
    fds: HashMap<RawFd, Vec<u64>>,
    done: watch::Sender<bool>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!(target = "reactor", "reactor started");

        while self.shared.running.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!(target = "reactor", error = %err, "poll failed, retrying");
                }
                continue;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(event.token().0 as RawFd, Ready::from_event(event));
            }
            self.drain_commands();
        }

        self.teardown();
        let _ = self.done.send(true);
    }

    fn dispatch(&mut self, fd: RawFd, ready: Ready) {
        let tokens = match self.fds.get(&fd) {
            Some(tokens) => tokens.clone(),
            None => return,
        };
        let mut fired = Vec::new();
        for token in tokens {
            let Some(registration) = self.registrations.get_mut(&token) else {
                continue;
            };
            if !ready.satisfies(registration.interest) {
                continue;
            }
            (registration.callback)(ready);
            if registration.transient {
                fired.push(token);
            }
        }
        for token in fired {
            self.remove(token);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if !self.shared.running.load(Ordering::Acquire) {
                // Dropping the ack reports cancellation to the registrant.
                continue;
            }
            match command {
                Command::Register {
                    token,
                    registration,
                    ack,
                } => {
                    let result = self.install(token, registration);
                    if let Err(Ok(())) = ack.send(result) {
                        // Registrant went away while the command was queued.
                        self.remove(token);
                    }
                }
                Command::Cancel(token) => self.remove(token),
            }
        }
    }

    fn combined_interest(&self, tokens: &[u64]) -> Option<Interest> {
        tokens
            .iter()
            .filter_map(|token| self.registrations.get(token))
            .map(|registration| registration.interest)
            .reduce(|a, b| a | b)
    }

    fn install(&mut self, token: u64, registration: Registration) -> io::Result<()> {
        let fd = registration.channel.as_raw_fd();
        let existing = self
            .fds
            .get(&fd)
            .and_then(|tokens| self.combined_interest(tokens));
        let interest = existing.map_or(registration.interest, |current| {
            current | registration.interest
        });

        let registry = self.poll.registry();
        if existing.is_some() {
            registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest.to_mio())?;
        } else {
            registry.register(&mut SourceFd(&fd), Token(fd as usize), interest.to_mio())?;
        }

        self.fds.entry(fd).or_default().push(token);
        self.registrations.insert(token, registration);
        Ok(())
    }

    fn remove(&mut self, token: u64) {
        let Some(registration) = self.registrations.remove(&token) else {
            return;
        };
        let fd = registration.channel.as_raw_fd();
        let remaining = match self.fds.get_mut(&fd) {
            Some(tokens) => {
                tokens.retain(|t| *t != token);
                tokens.clone()
            }
            None => return,
        };

        let interest = self.combined_interest(&remaining);
        if interest.is_none() {
            self.fds.remove(&fd);
        }
        let registry = self.poll.registry();
        let result = match interest {
            Some(interest) => {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest.to_mio())
            }
            None => registry.deregister(&mut SourceFd(&fd)),
        };
        if let Err(err) = result {
            debug!(target = "reactor", fd, error = %err, "failed to update registration");
        }
        // The descriptor may close here, after it has left the poller.
        drop(registration);
    }

    fn teardown(&mut self) {
        while self.commands.try_recv().is_ok() {}

        let registry = self.poll.registry();
        for fd in self.fds.keys() {
            let _ = registry.deregister(&mut SourceFd(fd));
        }
        let released = self.registrations.len();
        self.fds.clear();
        self.registrations.clear();
        debug!(target = "reactor", released, "reactor stopped");
    }
}
