//! Single-threaded cooperative run loop
//!
//! Owns socket and timer registrations and dispatches their callbacks on the
//! calling thread. A tokio current-thread runtime is used only to wait for
//! socket readiness or the earliest timer; callbacks are plain closures that
//! run to completion, one at a time.
//!
//! Dispatch order within one cycle: due timers by (deadline, registration),
//! then ready sockets by registration. Registrations made or re-armed by a
//! callback take effect from the next cycle. Cancellation is immediate and
//! idempotent.

mod socket;


pub use socket::LoopSocket;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::select_all;
use tokio::runtime::{Builder, Runtime};
use tracing::{trace, warn};

use crate::error::Result;

/// Timer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Socket registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

type TimerCallback = Box<dyn FnMut(&LoopHandle, TimerId)>;
type SocketCallback = Box<dyn FnMut(&LoopHandle)>;

struct TimerEntry {
    /// `None` while firing and not re-armed
    deadline: Option<Instant>,
    /// `None` while firing
    callback: Option<TimerCallback>,
}

struct SocketEntry {
    socket: Rc<LoopSocket>,
    /// `None` while dispatching
    callback: Option<SocketCallback>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    timers: HashMap<TimerId, TimerEntry>,
    schedule: BTreeSet<(Instant, TimerId)>,
    sockets: BTreeMap<SocketId, SocketEntry>,
    stop_requested: bool,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Why [`RunLoop::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// [`LoopHandle::stop`] was called
    Stopped,
    /// The timeout elapsed
    TimedOut,
    /// No sockets or timers are registered
    Idle,
}

/// Cloneable handle for registering sources from anywhere on the loop thread,
/// including inside callbacks
#[derive(Clone)]
pub struct LoopHandle {
    registry: Rc<RefCell<Registry>>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("LoopHandle")
            .field("timers", &registry.timers.len())
            .field("sockets", &registry.sockets.len())
            .field("stop_requested", &registry.stop_requested)
            .finish()
    }
}

impl LoopHandle {
    /// Register a one-shot timer. The callback may re-arm it with
    /// [`rearm`](Self::rearm).
    pub fn add_timer(
        &self,
        deadline: Instant,
        callback: impl FnMut(&LoopHandle, TimerId) + 'static,
    ) -> TimerId {
        let mut registry = self.registry.borrow_mut();
        let id = TimerId(registry.next_id());
        registry.timers.insert(
            id,
            TimerEntry {
                deadline: Some(deadline),
                callback: Some(Box::new(callback)),
            },
        );
        registry.schedule.insert((deadline, id));
        id
    }

    /// Register a one-shot timer `delay` from now
    pub fn add_timer_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&LoopHandle, TimerId) + 'static,
    ) -> TimerId {
        self.add_timer(Instant::now() + delay, callback)
    }

    /// Move a registered timer to `deadline`, or re-arm it from inside its
    /// own callback. Returns false if the timer no longer exists.
    pub fn rearm(&self, id: TimerId, deadline: Instant) -> bool {
        let mut registry = self.registry.borrow_mut();
        let Some(entry) = registry.timers.get_mut(&id) else {
            return false;
        };
        let previous = entry.deadline.replace(deadline);
        if let Some(previous) = previous {
            registry.schedule.remove(&(previous, id));
        }
        registry.schedule.insert((deadline, id));
        true
    }

    /// Cancel a timer. Cancelling twice is a no-op.
    pub fn cancel_timer(&self, id: TimerId) {
        let mut registry = self.registry.borrow_mut();
        if let Some(entry) = registry.timers.remove(&id) {
            if let Some(deadline) = entry.deadline {
                registry.schedule.remove(&(deadline, id));
            }
        }
    }

    /// Pending deadline of a timer
    #[must_use]
    pub fn timer_deadline(&self, id: TimerId) -> Option<Instant> {
        self.registry
            .borrow()
            .timers
            .get(&id)
            .and_then(|entry| entry.deadline)
    }

    /// Register a socket; the callback runs whenever it is readable
    pub fn add_socket(
        &self,
        socket: Rc<LoopSocket>,
        callback: impl FnMut(&LoopHandle) + 'static,
    ) -> SocketId {
        let mut registry = self.registry.borrow_mut();
        let id = SocketId(registry.next_id());
        registry.sockets.insert(
            id,
            SocketEntry {
                socket,
                callback: Some(Box::new(callback)),
            },
        );
        id
    }

    /// Remove a socket registration. Removing twice is a no-op.
    pub fn remove_socket(&self, id: SocketId) {
        self.registry.borrow_mut().sockets.remove(&id);
    }

    /// Make the current or next [`RunLoop::run`] return once the running
    /// callback completes
    pub fn stop(&self) {
        self.registry.borrow_mut().stop_requested = true;
    }

    /// Number of registered timers
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.registry.borrow().timers.len()
    }

    /// Number of registered sockets
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.registry.borrow().sockets.len()
    }

    /// Check whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let registry = self.registry.borrow();
        registry.timers.is_empty() && registry.sockets.is_empty()
    }

    fn stop_requested(&self) -> bool {
        self.registry.borrow().stop_requested
    }

    fn take_stop(&self) -> bool {
        std::mem::take(&mut self.registry.borrow_mut().stop_requested)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.registry
            .borrow()
            .schedule
            .first()
            .map(|(deadline, _)| *deadline)
    }

    fn due_timers(&self, now: Instant) -> Vec<TimerId> {
        self.registry
            .borrow()
            .schedule
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, id)| *id)
            .collect()
    }

    fn sockets(&self) -> Vec<(SocketId, Rc<LoopSocket>)> {
        self.registry
            .borrow()
            .sockets
            .iter()
            .map(|(id, entry)| (*id, Rc::clone(&entry.socket)))
            .collect()
    }

    fn fire_timer(&self, id: TimerId, now: Instant) -> bool {
        let mut callback = {
            let mut registry = self.registry.borrow_mut();
            let Some(entry) = registry.timers.get_mut(&id) else {
                return false;
            };
            let Some(deadline) = entry.deadline.filter(|deadline| *deadline <= now) else {
                return false;
            };
            let Some(callback) = entry.callback.take() else {
                return false;
            };
            entry.deadline = None;
            registry.schedule.remove(&(deadline, id));
            callback
        };

        callback(self, id);

        let mut registry = self.registry.borrow_mut();
        let rearmed = match registry.timers.get_mut(&id) {
            Some(entry) if entry.deadline.is_some() => {
                entry.callback = Some(callback);
                true
            }
            _ => false,
        };
        if !rearmed {
            registry.timers.remove(&id);
        }
        true
    }

    fn fire_socket(&self, id: SocketId) -> bool {
        let callback = self
            .registry
            .borrow_mut()
            .sockets
            .get_mut(&id)
            .and_then(|entry| entry.callback.take());
        let Some(mut callback) = callback else {
            return false;
        };

        callback(self);

        if let Some(entry) = self.registry.borrow_mut().sockets.get_mut(&id) {
            if entry.callback.is_none() {
                entry.callback = Some(callback);
            }
        }
        true
    }
}

/// The run loop
pub struct RunLoop {
    runtime: Runtime,
    handle: LoopHandle,
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl RunLoop {
    /// Create a run loop
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Network` if the I/O driver cannot be created.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            handle: LoopHandle {
                registry: Rc::new(RefCell::new(Registry::default())),
            },
        })
    }

    /// Handle for registering sources
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Bind a non-blocking UDP socket usable with this loop
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Network` if binding fails.
    pub fn bind_udp(&self, addr: SocketAddr) -> Result<Rc<LoopSocket>> {
        let _guard = self.runtime.enter();
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let sender = std_socket.try_clone()?;
        let io = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Rc::new(LoopSocket::new(io, sender)))
    }

    /// Request [`run`](Self::run) to return
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Dispatch events until stopped, until `timeout` elapses or until
    /// nothing is registered.
    ///
    /// With no timers and no sockets there is nothing left to wait for, so
    /// this returns [`RunOutcome::Idle`] at once even when a timeout is
    /// given.
    pub fn run(&self, timeout: Option<Duration>) -> RunOutcome {
        let limit = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.handle.take_stop() {
                return RunOutcome::Stopped;
            }
            if self.handle.is_empty() {
                return RunOutcome::Idle;
            }
            if limit.is_some_and(|limit| Instant::now() >= limit) {
                return RunOutcome::TimedOut;
            }
            self.cycle(limit);
        }
    }

    /// Wait once (at most `timeout`) and dispatch what is ready. Returns
    /// the number of callbacks run.
    ///
    /// A pending stop is left in place for the next [`run`](Self::run): if
    /// one was requested before this call nothing is waited for or
    /// dispatched, and one requested by a callback ends the cycle early.
    pub fn run_once(&self, timeout: Option<Duration>) -> usize {
        if self.handle.stop_requested() {
            return 0;
        }
        let limit = timeout.map(|timeout| Instant::now() + timeout);
        self.cycle(limit)
    }

    fn cycle(&self, limit: Option<Instant>) -> usize {
        let wake = match (self.handle.next_deadline(), limit) {
            (Some(timer), Some(limit)) => Some(timer.min(limit)),
            (timer, limit) => timer.or(limit),
        };
        let ready = self.wait(self.handle.sockets(), wake);
        self.dispatch(&ready)
    }

    fn wait(&self, sockets: Vec<(SocketId, Rc<LoopSocket>)>, wake: Option<Instant>) -> Vec<SocketId> {
        if sockets.is_empty() {
            if let Some(wake) = wake {
                self.runtime
                    .block_on(async move { tokio::time::sleep_until(wake.into()).await });
            }
            return Vec::new();
        }

        let waits: Vec<_> = sockets
            .into_iter()
            .map(|(id, socket)| {
                Box::pin(async move { socket.readable().await.map(|()| id) })
            })
            .collect();

        self.runtime.block_on(async move {
            let (first, _, rest) = match wake {
                Some(wake) => {
                    match tokio::time::timeout_at(wake.into(), select_all(waits)).await {
                        Ok(done) => done,
                        Err(_) => return Vec::new(),
                    }
                }
                None => select_all(waits).await,
            };

            let mut ready = Vec::new();
            for result in std::iter::once(first).chain(rest.into_iter().filter_map(FutureExt::now_or_never)) {
                match result {
                    Ok(id) => ready.push(id),
                    Err(e) => warn!(error = %e, "socket readiness failed"),
                }
            }
            ready.sort_unstable();
            ready
        })
    }

    fn dispatch(&self, ready: &[SocketId]) -> usize {
        let now = Instant::now();
        let due = self.handle.due_timers(now);
        let mut dispatched = 0;

        for id in due {
            if self.handle.stop_requested() {
                return dispatched;
            }
            if self.handle.fire_timer(id, now) {
                dispatched += 1;
            }
        }
        for id in ready {
            if self.handle.stop_requested() {
                return dispatched;
            }
            if self.handle.fire_socket(*id) {
                dispatched += 1;
            }
        }

        if dispatched > 0 {
            trace!(dispatched, "run loop cycle");
        }
        dispatched
    }
}
