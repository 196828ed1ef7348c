use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use matches::assert_matches;

use super::*;
use crate::testing::*;

const A: Cid = Cid::DYNAMIC_MIN;
const B: Cid = Cid::new(0x0041);

fn channel_with(
    cfg: &Config,
    bredr: DataBufferInfo,
    le: DataBufferInfo,
) -> (Rc<MockTransport>, CommandChannel, AclDataChannel) {
    let (_d, t, link) = link();
    let cmd = CommandChannel::new(Rc::clone(&link), cfg);
    let acl = AclDataChannel::new(link, cmd.clone(), cfg, bredr, le).unwrap();
    (t, cmd, acl)
}

fn channel(max_len: u16, max_pkts: u16) -> (Rc<MockTransport>, CommandChannel, AclDataChannel) {
    let info = DataBufferInfo::new(max_len, max_pkts);
    channel_with(&Config::default(), info, DataBufferInfo::default())
}

fn data(h: u16, id: u8) -> AclDataPacket {
    frag(h, id, PacketBoundary::FirstNonFlushable)
}

fn frag(h: u16, id: u8, pb: PacketBoundary) -> AclDataPacket {
    AclDataPacket::new(hdl(h), pb, BroadcastFlag::PointToPoint, &[id])
}

/// Returns the handles and payload markers of written ACL packets.
fn sent(t: &MockTransport) -> Vec<(u16, u8)> {
    (t.take(PacketType::Acl).iter())
        .map(|raw| {
            let p = AclDataPacket::parse(raw).unwrap();
            (u16::from(p.handle()), p.payload()[0])
        })
        .collect()
}

fn ids(t: &MockTransport) -> Vec<u8> {
    sent(t).into_iter().map(|(_, id)| id).collect()
}

#[test]
fn credit_window() {
    let (t, c, acl) = channel(5, 5);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    for id in 1..=6 {
        let p = AclDataPacket::new(hdl(1), PacketBoundary::FirstNonFlushable, BroadcastFlag::PointToPoint, &[id; 5]);
        acl.send_packet(p, A, Priority::Low).unwrap();
    }
    assert_eq!(ids(&t), [1, 2, 3, 4, 5]);
    assert_eq!(acl.stats().queued, 1);
    assert_eq!(acl.stats().in_flight, 5);

    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(ids(&t), [6]);
    assert_eq!(acl.stats().queued, 0);
    assert_eq!(acl.stats().in_flight, 5);
}

#[test]
fn credit_conservation() {
    let (t, c, acl) = channel(10, 5);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    for n in [1_u8, 3, 5] {
        for id in 0..n {
            acl.send_packet(data(1, id), A, Priority::Low).unwrap();
        }
        assert_eq!(ids(&t).len(), usize::from(n));
        c.on_event(&nocp(&[(1, u16::from(n))]));
        assert_eq!(acl.stats().in_flight, 0);
    }
    for id in 0..5 {
        acl.send_packet(data(1, id), A, Priority::Low).unwrap();
    }
    assert_eq!(ids(&t), [0, 1, 2, 3, 4]);
    assert_eq!(acl.stats().excess_completions, 0);
}

#[test]
fn priority_precedence() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 3), B, Priority::Low).unwrap();
    acl.send_packet(data(1, 4), Cid::SIGNAL, Priority::High).unwrap();
    acl.send_packet(data(1, 5), A, Priority::High).unwrap();
    assert_eq!(ids(&t), [1]);
    for want in [4, 5, 2, 3] {
        c.on_event(&nocp(&[(1, 1)]));
        assert_eq!(ids(&t), [want]);
    }
}

#[test]
fn high_priority_fifo_across_links() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(2, 2), A, Priority::Low).unwrap();
    acl.send_packet(data(2, 3), A, Priority::High).unwrap();
    acl.send_packet(data(1, 4), A, Priority::High).unwrap();
    assert_eq!(sent(&t), [(1, 1)]);
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(sent(&t), [(2, 3)]);
    c.on_event(&nocp(&[(2, 1)]));
    assert_eq!(sent(&t), [(1, 4)]);
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(sent(&t), [(2, 2)]);
}

#[test]
fn round_robin() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::BrEdr).unwrap();
    for id in 1..=3 {
        acl.send_packet(data(1, id), A, Priority::Low).unwrap();
    }
    for id in 4..=5 {
        acl.send_packet(data(2, id), A, Priority::Low).unwrap();
    }
    let mut order = Vec::new();
    loop {
        let s = sent(&t);
        let Some(&(h, id)) = s.first() else { break };
        assert_eq!(s.len(), 1);
        order.push(id);
        c.on_event(&nocp(&[(h, 1)]));
    }
    assert_eq!(order, [1, 4, 2, 5, 3]);
    assert_eq!(acl.stats().in_flight, 0);
}

#[test]
fn drop_isolation() {
    let cfg = Config {
        max_channel_queue_len: 2,
        ..Config::default()
    };
    let info = DataBufferInfo::new(10, 1);
    let (t, c, acl) = channel_with(&cfg, info, DataBufferInfo::default());
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), B, Priority::Low).unwrap();
    acl.send_packet(data(2, 3), A, Priority::Low).unwrap();
    for id in 4..=7 {
        acl.send_packet(data(1, id), A, Priority::Low).unwrap();
    }
    acl.send_packet(data(1, 8), A, Priority::High).unwrap();
    assert_eq!(acl.stats().dropped, 2);
    assert_eq!(acl.stats().queued, 5);
    assert_eq!(ids(&t), [1]);

    let mut rest = Vec::new();
    while acl.stats().in_flight > 0 {
        c.on_event(&nocp(&[(1, 1), (2, 1)]));
        rest.extend(ids(&t));
    }
    assert_eq!(rest, [8, 3, 2, 6, 7]);
}

#[test]
fn fragments_not_interleaved() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    let pdu = vec![
        frag(1, 1, PacketBoundary::FirstNonFlushable),
        frag(1, 2, PacketBoundary::Continuing),
        frag(1, 3, PacketBoundary::Continuing),
    ];
    acl.send_packets(pdu, A, Priority::Low).unwrap();
    acl.send_packet(data(1, 4), Cid::SIGNAL, Priority::High).unwrap();
    assert_eq!(ids(&t), [1]);
    for want in [2, 3, 4] {
        c.on_event(&nocp(&[(1, 1)]));
        assert_eq!(ids(&t), [want]);
    }
}

#[test]
fn invalid_packets() {
    let (t, _c, acl) = channel(4, 5);
    assert_matches!(
        acl.send_packet(data(1, 1), A, Priority::Low),
        Err(Error::UnknownConnection(_))
    );
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    assert_matches!(
        acl.register_link(hdl(1), LinkType::Le),
        Err(Error::ConnectionExists(_))
    );
    let big = AclDataPacket::new(hdl(1), PacketBoundary::FirstFlushable, BroadcastFlag::PointToPoint, &[0; 5]);
    assert_matches!(
        acl.send_packet(big, A, Priority::Low),
        Err(Error::PayloadTooLarge { len: 5, max: 4 })
    );
    assert_matches!(
        acl.send_packets(Vec::new(), A, Priority::Low),
        Err(Error::InvalidFragments)
    );
    assert_matches!(
        acl.send_packet(frag(1, 1, PacketBoundary::Continuing), A, Priority::Low),
        Err(Error::InvalidFragments)
    );
    let two_pdus = vec![data(1, 1), data(1, 2)];
    assert_matches!(
        acl.send_packets(two_pdus, A, Priority::Low),
        Err(Error::InvalidFragments)
    );
    acl.register_link(hdl(2), LinkType::BrEdr).unwrap();
    let two_links = vec![data(1, 1), frag(2, 2, PacketBoundary::Continuing)];
    assert_matches!(
        acl.send_packets(two_links, A, Priority::Low),
        Err(Error::InvalidFragments)
    );
    assert!(t.sent().is_empty());
    assert_eq!(acl.stats().queued, 0);
}

#[test]
fn le_buffer() {
    let info = DataBufferInfo::new(10, 1);
    let le = DataBufferInfo::new(27, 1);
    let (t, c, acl) = channel_with(&Config::default(), info, le);
    assert_eq!(acl.buffer_info(), info);
    assert_eq!(acl.le_buffer_info(), le);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::Le).unwrap();
    for (h, id) in [(1, 1), (1, 2), (2, 3), (2, 4)] {
        acl.send_packet(data(h, id), A, Priority::Low).unwrap();
    }
    assert_eq!(sent(&t), [(1, 1), (2, 3)]);
    assert_eq!((acl.stats().in_flight, acl.stats().le_in_flight), (1, 1));
    c.on_event(&nocp(&[(2, 1)]));
    assert_eq!(sent(&t), [(2, 4)]);
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(sent(&t), [(1, 2)]);
}

#[test]
fn shared_buffer() {
    let (t, c, acl) = channel(10, 1);
    assert_eq!(acl.le_buffer_info(), acl.buffer_info());
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::Le).unwrap();
    acl.send_packet(data(2, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    assert_eq!(sent(&t), [(2, 1)]);
    assert_eq!((acl.stats().in_flight, acl.stats().le_in_flight), (1, 0));
    c.on_event(&nocp(&[(2, 1)]));
    assert_eq!(sent(&t), [(1, 2)]);

    // LE-only controller
    let le = DataBufferInfo::new(27, 3);
    let (_, _, acl) = channel_with(&Config::default(), DataBufferInfo::default(), le);
    assert_eq!(acl.buffer_info(), le);
    assert_eq!(acl.le_buffer_info(), le);

    let (_d, _t, link) = link();
    let cmd = CommandChannel::new(Rc::clone(&link), &Config::default());
    let none = DataBufferInfo::default();
    assert_matches!(
        AclDataChannel::new(link, cmd, &Config::default(), none, none),
        Err(Error::BufferUnavailable)
    );
}

#[test]
fn drop_queued_packets() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 3), B, Priority::Low).unwrap();
    acl.send_packet(data(1, 4), A, Priority::High).unwrap();
    assert_eq!(acl.drop_queued_packets(|_, cid| cid == A), 2);
    assert_eq!(acl.drop_queued_packets(|_, cid| cid == A), 0);
    assert_eq!(ids(&t), [1]);
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(ids(&t), [3]);
    c.on_event(&nocp(&[(1, 1)]));
    assert!(ids(&t).is_empty());
}

#[test]
fn unregister_keeps_credit() {
    let (t, c, acl) = channel(10, 2);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::BrEdr).unwrap();
    for id in 1..=3 {
        acl.send_packet(data(1, id), A, Priority::Low).unwrap();
    }
    acl.send_packet(data(2, 4), A, Priority::Low).unwrap();
    assert_eq!(ids(&t), [1, 2]);

    acl.unregister_link(hdl(1)).unwrap();
    assert_matches!(acl.unregister_link(hdl(1)), Err(Error::UnknownConnection(_)));
    assert_eq!(acl.stats().queued, 1);
    assert!(ids(&t).is_empty());

    // Completions are still credited after unregistration
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(ids(&t), [4]);
    assert_eq!(acl.stats().in_flight, 2);

    // Ignored for registered links
    acl.clear_controller_packet_count(hdl(2));
    assert_eq!(acl.stats().in_flight, 2);
    acl.clear_controller_packet_count(hdl(1));
    assert_eq!(acl.stats().in_flight, 1);
    c.on_event(&nocp(&[(1, 1)]));
    assert_eq!(acl.stats().in_flight, 1);
    c.on_event(&nocp(&[(2, 1)]));
    assert_eq!(acl.stats().in_flight, 0);
}

#[test]
fn excess_completions() {
    let (_t, c, acl) = channel(10, 5);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    c.on_event(&nocp(&[(1, 5), (0x77, 3)]));
    let st = acl.stats();
    assert_eq!((st.in_flight, st.excess_completions), (0, 1));
    c.on_event(&nocp(&[(0x77, 1)]));
    assert_eq!(acl.stats().excess_completions, 1);
}

#[test]
fn data_rx() {
    let (_t, _c, acl) = channel(10, 5);
    let raw = data(1, 7);
    acl.receive(raw.as_ref());
    let got = Rc::new(RefCell::new(Vec::new()));
    {
        let got = Rc::clone(&got);
        acl.set_data_rx_handler(move |p| got.borrow_mut().push(p.payload().to_vec()));
    }
    acl.receive(raw.as_ref());
    // Declared length does not match the payload
    acl.receive(&[0x01, 0x20, 0x02, 0x00, 0x07]);
    acl.receive(&[0x01]);
    assert_eq!(*got.borrow(), [vec![7]]);
}

#[test]
fn shutdown_from_rx_handler() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    let n = Rc::new(Cell::new(0));
    {
        let (n, acl2) = (Rc::clone(&n), acl.clone());
        acl.set_data_rx_handler(move |_| {
            n.set(n.get() + 1);
            acl2.shutdown();
        });
    }
    let raw = data(1, 7);
    acl.receive(raw.as_ref());
    acl.receive(raw.as_ref());
    assert_eq!(n.get(), 1);

    assert_eq!(ids(&t), [1]);
    c.on_event(&nocp(&[(1, 1)]));
    assert!(ids(&t).is_empty());
    assert_matches!(
        acl.register_link(hdl(2), LinkType::BrEdr),
        Err(Error::Closed)
    );
    assert_matches!(
        acl.send_packet(data(1, 3), A, Priority::Low),
        Err(Error::Closed)
    );
}

#[test]
fn flush_timeout() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.register_link(hdl(2), LinkType::Le).unwrap();
    let done = Rc::new(RefCell::new(Vec::new()));
    let cb = || {
        let done = Rc::clone(&done);
        move |r: Result<()>| done.borrow_mut().push(r)
    };
    let ms = Duration::from_millis;
    assert_matches!(
        acl.set_bredr_automatic_flush_timeout(None, hdl(2), cb()),
        Err(Error::WrongLinkType { typ: LinkType::Le, .. })
    );
    assert_matches!(
        acl.set_bredr_automatic_flush_timeout(None, hdl(3), cb()),
        Err(Error::UnknownConnection(_))
    );
    for d in [ms(0), ms(1280)] {
        assert_matches!(
            acl.set_bredr_automatic_flush_timeout(Some(d), hdl(1), cb()),
            Err(Error::InvalidFlushTimeout)
        );
    }
    assert!(t.sent().is_empty());

    acl.set_bredr_automatic_flush_timeout(Some(ms(10)), hdl(1), cb())
        .unwrap();
    assert_eq!(
        t.take(PacketType::Command),
        [vec![0x28, 0x0C, 0x04, 0x01, 0x00, 0x10, 0x00]]
    );
    c.on_event(&cmd_complete(Opcode::WRITE_AUTOMATIC_FLUSH_TIMEOUT, 1, Status::Success));

    acl.set_bredr_automatic_flush_timeout(None, hdl(1), cb())
        .unwrap();
    assert_eq!(
        t.take(PacketType::Command),
        [vec![0x28, 0x0C, 0x04, 0x01, 0x00, 0x00, 0x00]]
    );
    let op = Opcode::WRITE_AUTOMATIC_FLUSH_TIMEOUT;
    c.on_event(&cmd_complete(op, 1, Status::UnknownConnectionIdentifier));

    acl.set_bredr_automatic_flush_timeout(Some(AclDataChannel::MAX_FLUSH_TIMEOUT), hdl(1), cb())
        .unwrap();
    assert_eq!(
        t.take(PacketType::Command),
        [vec![0x28, 0x0C, 0x04, 0x01, 0x00, 0xFF, 0x07]]
    );
    c.on_event(&cmd_complete(op, 1, Status::Success));

    // 1 ms is 1.6 slots
    acl.set_bredr_automatic_flush_timeout(Some(ms(1)), hdl(1), cb())
        .unwrap();
    assert_eq!(
        t.take(PacketType::Command),
        [vec![0x28, 0x0C, 0x04, 0x01, 0x00, 0x02, 0x00]]
    );

    let done = done.borrow();
    assert_eq!(done.len(), 3);
    assert_matches!(done[0], Ok(()));
    assert_matches!(
        done[1],
        Err(Error::CommandFailed {
            status: Status::UnknownConnectionIdentifier,
            ..
        })
    );
    assert_matches!(done[2], Ok(()));
}

#[test]
fn shutdown_removes_handlers() {
    let (t, c, acl) = channel(10, 1);
    acl.register_link(hdl(1), LinkType::BrEdr).unwrap();
    acl.send_packet(data(1, 1), A, Priority::Low).unwrap();
    acl.send_packet(data(1, 2), A, Priority::Low).unwrap();
    assert_eq!(ids(&t), [1]);
    acl.shutdown();
    acl.shutdown();
    assert_eq!(acl.stats().queued, 0);
    assert_matches!(
        c.add_event_handler(EventCode::NUMBER_OF_COMPLETED_PACKETS, |_| {
            EventCallbackResult::Remove
        }),
        Ok(_)
    );
    c.on_event(&nocp(&[(1, 1)]));
    assert!(ids(&t).is_empty());
}
