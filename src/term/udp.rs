//! UDP terminator: turns IP packets carrying a UDP datagram for one flow
//! into data events for a handler, with an inactivity timer that evicts the
//! terminator once the flow has been idle for too long.
//!
//! Grounded on `UdpTerminator.{hpp,cpp}`, which is considerably simpler
//! than its TCP counterpart: there is no state machine, just a flow tuple
//! and an inactivity timer that restarts on every packet or outbound send.
//! The original's "delete this when the timer fires or the flow is
//! removed" is replaced by [`Disposition`] (see `term::tcp`), same as the
//! TCP terminator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::addr::IpAddr;
use crate::config::UdpTerminatorConfig;
use crate::error::{Result, TermError};
use crate::flow::FlowDescriptor;
use crate::iface::{PacketSink, TimerHandle, TimerManager};
use crate::packet::udp::{self, UdpView};
use crate::packet::{ip, Packet, Proto};

use super::tcp::Disposition;

const DEFAULT_TTL: u8 = 64;

/// Callbacks the embedder supplies to a [`UdpTerminator`], mirroring the
/// original's pure-virtual `receiveData`/`sendPacket` hooks.
pub trait UdpTerminatorHandler {
    /// Delivers one datagram's payload. Unlike the TCP terminator there is
    /// no partial-consumption contract: a UDP terminator either accepts a
    /// whole datagram or drops it.
    fn receive_data(&mut self, data: &[u8]) -> Result<()>;
}

/// A UDP terminator for one flow, driven by the embedder: packets in via
/// [`UdpTerminator::on_packet`], application data out via
/// [`UdpTerminator::send_data`], timer expiry via
/// [`UdpTerminator::on_timer_fired`].
pub struct UdpTerminator {
    pub client_addr: IpAddr,
    pub server_addr: IpAddr,
    pub client_port: u16,
    pub server_port: u16,
    idle_ms: u32,
    timer_handle: Option<TimerHandle>,
    /// Flipped by the scheduled timer's callback when it actually fires.
    /// The embedder is expected to call [`UdpTerminator::on_timer_fired`]
    /// when it observes this flag set (or, more commonly, when it receives
    /// the timer expiry through its own event loop keyed off the
    /// `TimerHandle`); this is not itself re-entered by the callback, since
    /// the callback has no access to the embedder's live I/O.
    timer_fired: Arc<AtomicBool>,
}

impl UdpTerminator {
    /// `desc` must describe a UDP flow (`proto == 17`).
    pub fn new(desc: &FlowDescriptor, config: UdpTerminatorConfig, timers: &mut dyn TimerManager) -> Result<Self> {
        if !desc.is_valid() || desc.proto != Proto::Udp.as_u8() as u16 {
            return Err(TermError::InvalidParameter(
                "UDP terminator requires a valid UDPv4/UDPv6 flow descriptor".into(),
            ));
        }
        let mut term = Self {
            client_addr: desc.client_addr,
            server_addr: desc.server_addr,
            client_port: desc.client_port,
            server_port: desc.server_port,
            idle_ms: config.idle_ms,
            timer_handle: None,
            timer_fired: Arc::new(AtomicBool::new(false)),
        };
        tracing::debug!(
            client = ?term.client_addr,
            server = ?term.server_addr,
            client_port = term.client_port,
            server_port = term.server_port,
            "new UDP terminator created"
        );
        term.restart_timer(timers);
        Ok(term)
    }

    fn restart_timer(&mut self, timers: &mut dyn TimerManager) {
        if self.idle_ms == 0 {
            return;
        }
        if let Some(old) = self.timer_handle.take() {
            timers.cancel(old);
        }
        self.timer_fired.store(false, Ordering::SeqCst);
        let flag = self.timer_fired.clone();
        self.timer_handle = Some(timers.schedule(self.idle_ms, Box::new(move || flag.store(true, Ordering::SeqCst))));
    }

    /// Returns whether the scheduled inactivity timer has actually fired,
    /// for embedders that poll rather than re-enter from the callback.
    pub fn timer_has_fired(&self) -> bool {
        self.timer_fired.load(Ordering::SeqCst)
    }

    /// Mirrors `timerExpired`: the inactivity timer always evicts this
    /// terminator when it fires, there being nothing else it could mean.
    pub fn on_timer_fired(&mut self) -> Disposition {
        tracing::debug!(
            client_port = self.client_port,
            server_port = self.server_port,
            "UDP terminator removed due to inactivity"
        );
        Disposition::Remove
    }

    /// Mirrors `flowRemoved`: the owning flow map is tearing this
    /// terminator down for some other reason (eviction pressure, shutdown).
    /// Returns the handle so the caller can cancel the still-armed timer.
    pub fn on_flow_removed(&mut self) -> Option<TimerHandle> {
        tracing::trace!(client_port = self.client_port, server_port = self.server_port, "UDP terminator removed");
        self.timer_handle.take()
    }

    /// Mirrors `packetReceived`: extracts the UDP payload from an inbound
    /// IP packet and delivers it to `handler`, restarting the inactivity
    /// timer first.
    pub fn on_packet(&mut self, packet: &Packet, handler: &mut dyn UdpTerminatorHandler, timers: &mut dyn TimerManager) -> Result<()> {
        let data = packet.linearize();
        let (_version, ihl, proto) = ip::examine(&data)?;
        if proto != Proto::Udp {
            return Err(TermError::InvalidData("packet is not UDP".into()));
        }
        let udp_view = UdpView::new(&data[ihl..])?;
        let payload = udp_view.payload();

        self.restart_timer(timers);

        handler.receive_data(payload)
    }

    /// Mirrors `sendData`: wraps `data` as this flow's UDP payload (server
    /// to client direction) and hands the resulting packet to `sink`.
    pub fn send_data(&mut self, data: &[u8], sink: &mut dyn PacketSink, timers: &mut dyn TimerManager) -> Result<()> {
        if data.is_empty() {
            tracing::error!(client_port = self.client_port, server_port = self.server_port, "not sending empty data packet");
            return Err(TermError::EmptyWrite);
        }

        self.restart_timer(timers);

        let pkt = udp::build(self.server_addr, self.server_port, self.client_addr, self.client_port, data, 0, DEFAULT_TTL)?;
        sink.send(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;

    struct FakeTimers {
        next_id: u64,
        scheduled: Vec<(u64, u32)>,
        cancelled: Vec<u64>,
        callbacks: std::collections::HashMap<u64, crate::iface::TimerCallback>,
    }

    impl FakeTimers {
        fn new() -> Self {
            Self { next_id: 1, scheduled: Vec::new(), cancelled: Vec::new(), callbacks: std::collections::HashMap::new() }
        }

        /// Runs the callback stored for `handle`, the way an embedder's real
        /// timer wheel would when the delay elapses.
        fn fire(&mut self, handle: TimerHandle) {
            if let Some(cb) = self.callbacks.remove(&handle.0) {
                cb();
            }
        }
    }

    impl TimerManager for FakeTimers {
        fn schedule(&mut self, delay_ms: u32, cb: crate::iface::TimerCallback) -> TimerHandle {
            let id = self.next_id;
            self.next_id += 1;
            self.scheduled.push((id, delay_ms));
            self.callbacks.insert(id, cb);
            TimerHandle(id)
        }

        fn cancel(&mut self, handle: TimerHandle) {
            self.cancelled.push(handle.0);
            self.callbacks.remove(&handle.0);
        }
    }

    struct RecordingSink {
        sent: RefCell<Vec<Packet>>,
    }

    impl PacketSink for RecordingSink {
        fn send(&mut self, pkt: Packet) -> Result<()> {
            self.sent.borrow_mut().push(pkt);
            Ok(())
        }
    }

    struct EchoHandler {
        received: Vec<Vec<u8>>,
    }

    impl UdpTerminatorHandler for EchoHandler {
        fn receive_data(&mut self, data: &[u8]) -> Result<()> {
            self.received.push(data.to_vec());
            Ok(())
        }
    }

    fn flow() -> FlowDescriptor {
        FlowDescriptor::new_v4(Proto::Udp.as_u8() as u16, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(8, 8, 8, 8), 53)
    }

    #[test]
    fn new_restarts_timer_when_idle_ms_nonzero() {
        let mut timers = FakeTimers::new();
        let term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 60_000 }, &mut timers).unwrap();
        assert_eq!(timers.scheduled, vec![(1, 60_000)]);
        assert!(term.timer_handle.is_some());
    }

    #[test]
    fn new_skips_timer_when_idle_ms_zero() {
        let mut timers = FakeTimers::new();
        let term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 0 }, &mut timers).unwrap();
        assert!(timers.scheduled.is_empty());
        assert!(term.timer_handle.is_none());
    }

    #[test]
    fn new_rejects_non_udp_flow() {
        let mut timers = FakeTimers::new();
        let tcp_flow = FlowDescriptor::new_v4(Proto::Tcp.as_u8() as u16, Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(8, 8, 8, 8), 80);
        assert!(UdpTerminator::new(&tcp_flow, UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).is_err());
    }

    #[test]
    fn on_packet_delivers_payload_and_restarts_timer() {
        let mut timers = FakeTimers::new();
        let mut term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        let mut handler = EchoHandler { received: Vec::new() };

        let pkt = udp::build(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            53,
            b"hello",
            0,
            64,
        )
        .unwrap();

        term.on_packet(&pkt, &mut handler, &mut timers).unwrap();
        assert_eq!(handler.received, vec![b"hello".to_vec()]);
        assert_eq!(timers.scheduled.len(), 2);
        assert_eq!(timers.cancelled, vec![1]);
    }

    #[test]
    fn send_data_rejects_empty_payload() {
        let mut timers = FakeTimers::new();
        let mut term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        let mut sink = RecordingSink { sent: RefCell::new(Vec::new()) };
        assert!(term.send_data(b"", &mut sink, &mut timers).is_err());
        assert!(sink.sent.borrow().is_empty());
    }

    #[test]
    fn send_data_builds_packet_from_server_to_client() {
        let mut timers = FakeTimers::new();
        let mut term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        let mut sink = RecordingSink { sent: RefCell::new(Vec::new()) };

        term.send_data(b"pong", &mut sink, &mut timers).unwrap();

        let sent = sink.sent.borrow();
        assert_eq!(sent.len(), 1);
        let data = sent[0].linearize();
        let (_version, ihl, proto) = ip::examine(&data).unwrap();
        assert_eq!(proto, Proto::Udp);
        let udp_view = UdpView::new(&data[ihl..]).unwrap();
        assert_eq!(udp_view.src_port(), 53);
        assert_eq!(udp_view.dest_port(), 5000);
        assert_eq!(udp_view.payload(), b"pong");
    }

    #[test]
    fn on_timer_fired_requests_removal() {
        let mut timers = FakeTimers::new();
        let mut term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        assert_eq!(term.on_timer_fired(), Disposition::Remove);
    }

    #[test]
    fn scheduled_callback_actually_flips_timer_fired_flag() {
        let mut timers = FakeTimers::new();
        let term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        let handle = term.timer_handle.unwrap();

        assert!(!term.timer_has_fired());
        timers.fire(handle);
        assert!(term.timer_has_fired());
    }

    #[test]
    fn firing_real_callback_then_on_timer_fired_requests_removal() {
        let mut timers = FakeTimers::new();
        let mut term = UdpTerminator::new(&flow(), UdpTerminatorConfig { idle_ms: 1000 }, &mut timers).unwrap();
        let handle = term.timer_handle.unwrap();

        timers.fire(handle);
        assert!(term.timer_has_fired());
        assert_eq!(term.on_timer_fired(), Disposition::Remove);
    }
}
