//! External collaborator interfaces.
//!
//! This crate is sans-IO: it never opens a socket for packet transport,
//! never runs its own event loop, and never owns a timer wheel. The
//! embedding application supplies all of that by implementing the traits
//! below, the same way the original toolkit treats its owner/event-loop as
//! an external collaborator consumed through callback interfaces rather
//! than something the networking classes create themselves.

use crate::error::Result;
use crate::packet::Packet;

/// Delivers inbound packets to the core. The embedder decides where bytes
/// come from — a tun device, a pcap replay, a test harness.
pub trait PacketSource {
    /// Returns the next available packet, or `None` if nothing is ready
    /// right now (non-blocking; the embedder's event loop decides when to
    /// poll again).
    fn recv(&mut self) -> Option<Packet>;
}

/// Accepts outbound packets produced by the core.
pub trait PacketSink {
    fn send(&mut self, pkt: Packet) -> Result<()>;
}

/// Opaque handle to a scheduled timer, returned by [`TimerManager::schedule`]
/// and accepted by [`TimerManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Cooperative timer scheduling. Expired timers run between loop
/// iterations, never preempting in-progress work — there is no signal-
/// driven or preemptive timer delivery in this crate.
///
/// `cb` is not the path back into a terminator's `on_timer_fired`: it only
/// flags that the timer has expired (the terminators use it to flip an
/// internal `Arc<AtomicBool>`, since `on_timer_fired` needs borrowed access
/// to the embedder's live `PacketSink`/`TimerManager`/`EventLoop`, which a
/// `'static` callback captured at `schedule` time cannot hold). The
/// embedder is responsible for re-entering the terminator's
/// `on_timer_fired` itself once `cb` runs, addressed by the `TimerHandle`
/// returned here — typically by running `cb` and looking up the owning
/// terminator by that handle.
pub trait TimerManager {
    fn schedule(&mut self, delay_ms: u32, cb: TimerCallback) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

/// A unit of work posted from a worker thread (the DNS resolver) back onto
/// the owner's single-threaded loop.
pub type OwnerTask = Box<dyn FnOnce() + Send>;

pub type LoopEndCallback = Box<dyn FnMut()>;

/// The owner's cooperative event loop. `loop_end_subscribe` registers a
/// callback to run once at the end of the current loop iteration (used by
/// the TCP terminator to batch packetization after all inbound processing
/// for this tick is done); `post` is the cross-thread handoff the DNS
/// worker threads use to deliver completions safely back onto the owner's
/// thread.
pub trait EventLoop {
    fn loop_end_subscribe(&mut self, cb: LoopEndCallback);
    fn post(&self, task: OwnerTask);
}
