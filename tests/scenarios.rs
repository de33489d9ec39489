//! End-to-end scenarios and invariant checks, exercised against the public
//! API the way an embedder would use it (packet source → flow map →
//! terminator → packet sink).

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use termnet::addr::IpAddr;
use termnet::packet::icmp::IcmpView;
use termnet::packet::ip;
use termnet::packet::tcp::{self, TcpOption, TcpView, FLAG_ACK, FLAG_SYN};
use termnet::packet::{Packet, Proto};
use termnet::{
    Eviction, ExpiryMode, FlowDescriptor, FlowMap, PacketSink, Result, TcpTerminator, TcpTerminatorConfig,
    TcpTerminatorHandler, TimerCallback, TimerHandle, TimerManager,
};

// --- scenario 1: ICMP echo request parses ---------------------------------

#[test]
fn scenario_1_icmp_echo_request_parses() {
    let bytes: &[u8] = &[
        0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x7f, 0, 0, 1, 0x7f, 0, 0, 2, 0x08,
        0x00, 0xf7, 0xff, 0, 0, 0, 0,
    ];
    let packet = Packet::from_bytes(bytes.to_vec().into());
    assert!(packet.is_valid());

    let data = packet.linearize();
    let (_version, ihl, proto) = ip::examine(&data).expect("well-formed IPv4 header");
    assert_eq!(proto, Proto::Icmp);

    let icmp = IcmpView::new(&data[ihl..]).unwrap();
    assert_eq!(icmp.icmp_type(), 8);
    assert!(icmp.is_echo_request());
    assert!(icmp.payload().is_empty());
}

// --- scenario 2: TCP SYN build/reparse round-trip -------------------------

#[test]
fn scenario_2_tcp_syn_roundtrip_mss_and_header_len() {
    let packet = tcp::build(
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        1,
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        2,
        FLAG_SYN,
        100,
        0,
        0,
        &[],
        &[TcpOption::mss(1460)],
        64,
    )
    .unwrap();

    let data = packet.linearize();
    let (_version, ihl, proto) = ip::examine(&data).unwrap();
    assert_eq!(proto, Proto::Tcp);

    let tcp_hdr = TcpView::new(&data[ihl..]).unwrap();
    assert!(tcp_hdr.has_flag(FLAG_SYN));
    assert_eq!(tcp_hdr.seq_num(), 100);
    assert_eq!(tcp_hdr.opt_mss(), Some(1460));
    assert_eq!(tcp_hdr.data_offset_bytes(), 24);
}

// --- scenario 3: flow map insert / find / remove --------------------------

#[test]
fn scenario_3_flow_map_insert_find_remove() {
    let mut map: FlowMap<&'static str> = FlowMap::new(10).unwrap();
    let primary = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 1234, Ipv4Addr::new(10, 0, 0, 2), 80);
    let secondary = FlowDescriptor::new_v4(6, Ipv4Addr::new(192, 168, 0, 1), 1234, Ipv4Addr::new(192, 168, 0, 2), 80);

    map.insert(primary, "flow-a").unwrap();

    assert!(map.get(&secondary).is_none());
    assert_eq!(map.get(&primary).copied(), Some("flow-a"));

    let removed = map.remove(&primary);
    assert_eq!(removed, Some("flow-a"));
    assert!(map.get(&primary).is_none());
}

#[test]
fn scenario_3b_dual_key_flow_findable_under_both_descriptors() {
    let mut map: FlowMap<&'static str> = FlowMap::new(10).unwrap();
    let primary = FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 1234, Ipv4Addr::new(10, 0, 0, 2), 80);
    let secondary = FlowDescriptor::new_v4(6, Ipv4Addr::new(192, 168, 0, 1), 1234, Ipv4Addr::new(192, 168, 0, 2), 80);

    map.insert_dual(primary, Some(secondary), "nat-flow").unwrap();
    assert_eq!(map.get(&primary).copied(), Some("nat-flow"));
    assert_eq!(map.get(&secondary).copied(), Some("nat-flow"));

    assert_eq!(map.remove(&secondary), Some("nat-flow"));
    assert!(map.get(&primary).is_none());
    assert!(map.get(&secondary).is_none());
}

#[test]
fn flow_map_expiry_evicts_during_lookup() {
    let mut map: FlowMap<bool> = FlowMap::new(8).unwrap();
    let expired = FlowDescriptor::new_v4(17, Ipv4Addr::new(10, 0, 0, 1), 1, Ipv4Addr::new(10, 0, 0, 2), 53);
    map.insert(expired, true).unwrap();

    let mut evicted = None;
    let found = map.find_with_expiry(&expired, ExpiryMode::ExpireFlows, |_| true, |desc, secondary, value| {
        evicted = Some((desc, secondary, value))
    });
    assert!(found.is_none());
    assert_eq!(evicted, Some((expired, None, true)));
    assert!(map.is_empty());
}

#[test]
fn eviction_enum_round_trips() {
    assert_eq!(Eviction::Retain, Eviction::Retain);
    assert_ne!(Eviction::Retain, Eviction::EvictNow);
}

// --- scenarios 4 & 5: TCP terminator handshake + duplicate SYN ------------

struct RecordingSink {
    sent: Rc<RefCell<Vec<Packet>>>,
}

impl PacketSink for RecordingSink {
    fn send(&mut self, pkt: Packet) -> Result<()> {
        self.sent.borrow_mut().push(pkt);
        Ok(())
    }
}

struct FakeTimers {
    next: u64,
}

impl TimerManager for FakeTimers {
    fn schedule(&mut self, _delay_ms: u32, _cb: TimerCallback) -> TimerHandle {
        self.next += 1;
        TimerHandle(self.next)
    }
    fn cancel(&mut self, _handle: TimerHandle) {}
}

struct NoopEventLoop;
impl termnet::EventLoop for NoopEventLoop {
    fn loop_end_subscribe(&mut self, _cb: termnet::LoopEndCallback) {}
    fn post(&self, _task: termnet::OwnerTask) {}
}

struct EchoHandler {
    received: Vec<u8>,
}

impl TcpTerminatorHandler for EchoHandler {
    fn receive_data(&mut self, data: &[u8]) -> Result<usize> {
        self.received.extend_from_slice(data);
        Ok(data.len())
    }
    fn initialize_receiver(&mut self, _syn_packet: &Packet) -> bool {
        true
    }
    fn receiving_completed(&mut self) {}
    fn sending_unblocked(&mut self) {}
}

fn client_syn(term: &TcpTerminator, seq: u32) -> Packet {
    tcp::build(
        term.client_addr,
        term.client_port,
        term.server_addr,
        term.server_port,
        FLAG_SYN,
        seq,
        0,
        8192,
        &[],
        &[TcpOption::mss(1460)],
        64,
    )
    .unwrap()
}

fn flow() -> FlowDescriptor {
    FlowDescriptor::new_v4(6, Ipv4Addr::new(10, 0, 0, 1), 40000, Ipv4Addr::new(93, 184, 216, 34), 80)
}

#[test]
fn scenario_4_handshake_then_data_delivery() {
    let mut term = TcpTerminator::new(&flow(), TcpTerminatorConfig::default(), 0).unwrap();
    let sent = Rc::new(RefCell::new(Vec::new()));
    let mut sink = RecordingSink { sent: sent.clone() };
    let mut timers = FakeTimers { next: 0 };
    let mut events = NoopEventLoop;
    let mut handler = EchoHandler { received: Vec::new() };

    term.on_packet(&client_syn(&term, 1000), &mut handler, &mut sink, &mut timers, &mut events).unwrap();
    assert_eq!(sent.borrow().len(), 1);

    let syn_ack = sent.borrow()[0].linearize();
    let (_v, ihl, _p) = ip::examine(&syn_ack).unwrap();
    let syn_ack_hdr = TcpView::new(&syn_ack[ihl..]).unwrap();
    assert!(syn_ack_hdr.has_flag(FLAG_SYN));
    assert_eq!(syn_ack_hdr.ack_num(), 1001);
    let server_isn = syn_ack_hdr.seq_num();

    let client_ack = tcp::build(
        term.client_addr,
        term.client_port,
        term.server_addr,
        term.server_port,
        FLAG_ACK,
        1001,
        server_isn.wrapping_add(1),
        8192,
        &[],
        &[],
        64,
    )
    .unwrap();
    term.on_packet(&client_ack, &mut handler, &mut sink, &mut timers, &mut events).unwrap();
    assert_eq!(term.state_name(), "Connected");

    let data_pkt = tcp::build(
        term.client_addr,
        term.client_port,
        term.server_addr,
        term.server_port,
        FLAG_ACK,
        1001,
        server_isn.wrapping_add(1),
        8192,
        &[b'x'; 100],
        &[],
        64,
    )
    .unwrap();
    term.on_packet(&data_pkt, &mut handler, &mut sink, &mut timers, &mut events).unwrap();
    assert_eq!(handler.received.len(), 100);

    let ack_pkt = sent.borrow().last().unwrap().linearize();
    let (_v, ihl2, _p) = ip::examine(&ack_pkt).unwrap();
    let ack_hdr = TcpView::new(&ack_pkt[ihl2..]).unwrap();
    assert!(ack_hdr.has_flag(FLAG_ACK));
    assert_eq!(ack_hdr.ack_num(), 1101);
}

#[test]
fn scenario_5_duplicate_syn_is_idempotent() {
    let mut term = TcpTerminator::new(&flow(), TcpTerminatorConfig::default(), 0).unwrap();
    let sent = Rc::new(RefCell::new(Vec::new()));
    let mut sink = RecordingSink { sent: sent.clone() };
    let mut timers = FakeTimers { next: 0 };
    let mut events = NoopEventLoop;
    let mut handler = EchoHandler { received: Vec::new() };

    term.on_packet(&client_syn(&term, 1000), &mut handler, &mut sink, &mut timers, &mut events).unwrap();
    assert_eq!(term.state_name(), "Init");
    assert_eq!(sent.borrow().len(), 1);
    let first = sent.borrow()[0].linearize().to_vec();

    term.on_packet(&client_syn(&term, 1000), &mut handler, &mut sink, &mut timers, &mut events).unwrap();
    assert_eq!(term.state_name(), "Init");
    assert_eq!(sent.borrow().len(), 2);
    let second = sent.borrow()[1].linearize().to_vec();
    assert_eq!(first, second);
}

// --- checksum partition invariant (spec.md §8) -----------------------------

#[test]
fn checksum_is_independent_of_chunk_partitioning() {
    let data: Vec<u8> = (0u16..777).map(|i| (i % 256) as u8).collect();
    let whole = termnet::checksum::IpChecksum::of(&data);

    for chunk_size in [1usize, 2, 3, 7, 16, 64] {
        let mut acc = termnet_checksum_accumulator();
        for chunk in data.chunks(chunk_size) {
            acc.add_bytes(chunk);
        }
        assert_eq!(acc.checksum(), whole, "chunk_size={chunk_size}");
    }
}

fn termnet_checksum_accumulator() -> termnet::checksum::IpChecksum {
    termnet::checksum::IpChecksum::new()
}
