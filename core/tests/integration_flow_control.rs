// Integration test for HCI transmit flow control
//
// Quota allocation, private and round-robin egress, segmentation and
// completion accounting against a recording transport.

mod common;

use acl_link_core::{
    DataRate, HciHandle, HciStatus, LinkError, LinkManagerConfig, LinkPriority, TimerKey,
    TransportDescriptor, TransportKind,
};
use common::{addr, frame, harness_with, Harness};

const CLASSIC: TransportKind = TransportKind::Classic;

fn with_buffers(buffers: u16) -> Harness {
    harness_with(
        LinkManagerConfig::default()
            .with_transport(CLASSIC, TransportDescriptor { mtu: 100, buffers }),
    )
}

#[test]
fn test_ack_restores_window_and_sends_queued_frame() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.connected_link(addr(2), CLASSIC, 2);
    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 2);

    for _ in 0..3 {
        h.manager.send_link_frame(a, frame(10)).unwrap();
    }
    assert_eq!(h.manager.link(a).unwrap().sent_not_acked, 2);
    assert_eq!(h.manager.link(a).unwrap().link_queue.len(), 1);
    assert_eq!(h.manager.flow(CLASSIC).window, 2);

    h.manager.on_completed_packets(HciHandle(1), 2).unwrap();

    let lcb = h.manager.link(a).unwrap();
    assert!(lcb.link_queue.is_empty());
    assert_eq!(lcb.sent_not_acked, 1);
    assert_eq!(h.manager.flow(CLASSIC).window, 3);
    assert_eq!(h.platform().segments_sent(HciHandle(1)), 3);
}

#[test]
fn test_high_priority_and_normal_split() {
    let mut h = harness_with(
        LinkManagerConfig::default()
            .with_transport(CLASSIC, TransportDescriptor { mtu: 100, buffers: 4 })
            .with_high_priority_quota(2),
    );
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let b = h.connected_link(addr(2), CLASSIC, 2);

    h.manager
        .set_priority(addr(1), CLASSIC, LinkPriority::High)
        .unwrap();

    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 2);
    assert_eq!(h.manager.link(b).unwrap().xmit_quota, 2);
    let flow = h.manager.flow(CLASSIC);
    assert_eq!(flow.rr_quota, 0);
    assert_eq!(flow.high_priority_links, 1);
    assert_eq!(flow.normal_priority_links, 1);
}

#[test]
fn test_high_priority_quota_shrinks() {
    let mut h = with_buffers(8);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let b = h.connected_link(addr(2), CLASSIC, 2);
    let c = h.connected_link(addr(3), CLASSIC, 3);
    for remote in [addr(1), addr(2)] {
        h.manager
            .set_priority(remote, CLASSIC, LinkPriority::High)
            .unwrap();
    }

    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 3);
    assert_eq!(h.manager.link(b).unwrap().xmit_quota, 3);
    assert_eq!(h.manager.link(c).unwrap().xmit_quota, 2);
}

#[test]
fn test_more_links_than_buffers_shares_round_robin() {
    let mut h = with_buffers(2);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let b = h.connected_link(addr(2), CLASSIC, 2);
    let c = h.connected_link(addr(3), CLASSIC, 3);
    for id in [a, b, c] {
        assert_eq!(h.manager.link(id).unwrap().xmit_quota, 0);
    }
    assert_eq!(h.manager.flow(CLASSIC).rr_quota, 2);

    h.manager.send_link_frame(a, frame(10)).unwrap();
    h.manager.send_link_frame(b, frame(10)).unwrap();
    h.manager.send_link_frame(c, frame(10)).unwrap();

    let flow = h.manager.flow(CLASSIC);
    assert_eq!(flow.rr_unacked, 2);
    assert_eq!(flow.window, 0);
    assert!(flow.check_round_robin);
    assert_eq!(h.manager.link(c).unwrap().link_queue.len(), 1);

    h.manager.on_completed_packets(HciHandle(1), 1).unwrap();

    assert!(h.manager.link(c).unwrap().link_queue.is_empty());
    assert_eq!(h.platform().segments_sent(HciHandle(3)), 1);
    assert_eq!(h.manager.flow(CLASSIC).rr_unacked, 2);
}

#[test]
fn test_leaving_round_robin_unfolds_unacked() {
    let mut h = with_buffers(2);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.connected_link(addr(2), CLASSIC, 2);
    h.connected_link(addr(3), CLASSIC, 3);
    h.manager.send_link_frame(a, frame(10)).unwrap();
    assert_eq!(h.manager.flow(CLASSIC).rr_unacked, 1);

    h.manager
        .on_disconnect_complete(HciHandle(3), HciStatus::PEER_USER)
        .unwrap();

    let lcb = h.manager.link(a).unwrap();
    assert_eq!(lcb.xmit_quota, 1);
    assert_eq!(lcb.sent_not_acked, 1);
    assert_eq!(h.manager.flow(CLASSIC).rr_unacked, 0);
    assert_eq!(h.manager.flow(CLASSIC).rr_quota, 0);

    h.manager.on_completed_packets(HciHandle(1), 1).unwrap();
    assert_eq!(h.manager.link(a).unwrap().sent_not_acked, 0);
    assert_eq!(h.manager.flow(CLASSIC).window, 2);
}

#[test]
fn test_entering_round_robin_folds_unacked() {
    let mut h = with_buffers(2);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.connected_link(addr(2), CLASSIC, 2);
    h.manager.send_link_frame(a, frame(10)).unwrap();
    assert_eq!(h.manager.flow(CLASSIC).rr_unacked, 0);

    h.connected_link(addr(3), CLASSIC, 3);

    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 0);
    assert_eq!(h.manager.flow(CLASSIC).rr_unacked, 1);
    assert_eq!(h.manager.flow(CLASSIC).rr_quota, 2);
}

#[test]
fn test_private_link_sends_whole_segmented_frame() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);

    h.manager.send_link_frame(a, frame(250)).unwrap();

    let p = h.platform();
    assert_eq!(p.sent.len(), 1);
    assert_eq!(p.sent[0].segments, 3);
    drop(p);
    assert!(!h.manager.link(a).unwrap().partial_segment_in_flight);
    assert_eq!(h.manager.flow(CLASSIC).window, 1);
}

#[test]
fn test_private_link_segmentation_clamped_by_window() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.manager.send_link_frame(a, frame(50)).unwrap();

    h.manager.send_link_frame(a, frame(450)).unwrap();
    assert_eq!(h.platform().sent[1].segments, 3);
    assert!(h.manager.link(a).unwrap().partial_segment_in_flight);

    h.return_last_burst(1);
    let lcb = h.manager.link(a).unwrap();
    assert!(!lcb.partial_segment_in_flight);
    assert_eq!(lcb.link_queue.front().map(|b| b.remaining()), Some(150));

    h.manager.on_completed_packets(HciHandle(1), 4).unwrap();
    assert_eq!(h.platform().sent[2].segments, 2);
    // 450 bytes at mtu 100
    assert_eq!(h.platform().segments_sent(HciHandle(1)), 1 + 5);
    assert_eq!(h.manager.flow(CLASSIC).window, 2);
}

#[test]
fn test_round_robin_link_sends_one_segment_per_turn() {
    let mut h = with_buffers(2);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.connected_link(addr(2), CLASSIC, 2);
    h.connected_link(addr(3), CLASSIC, 3);

    h.manager.send_link_frame(a, frame(250)).unwrap();
    assert_eq!(h.platform().sent[0].segments, 1);
    assert!(h.manager.link(a).unwrap().partial_segment_in_flight);

    h.return_last_burst(1);
    assert_eq!(h.platform().sent.len(), 2);
    assert_eq!(h.manager.flow(CLASSIC).window, 0);

    h.manager.on_completed_packets(HciHandle(1), 2).unwrap();
    h.return_last_burst(1);
    assert_eq!(h.platform().segments_sent(HciHandle(1)), 3);
    assert!(h.manager.link(a).unwrap().link_queue.is_empty());
}

#[test]
fn test_link_queue_served_before_channels() {
    let mut h = with_buffers(8);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let cid = h.attach(a, 0x40);
    h.platform().power_pending = true;
    h.manager.send_channel_frame(cid, frame(10)).unwrap();
    h.manager.send_link_frame(a, frame(11)).unwrap();
    assert!(h.platform().sent.is_empty());

    h.platform().power_pending = false;
    h.manager.on_completed_packets(HciHandle(1), 0).unwrap();

    let p = h.platform();
    assert_eq!(p.sent.len(), 2);
    assert_eq!(p.sent[0].channel, None);
    assert_eq!(p.sent[1].channel, Some(cid));
}

#[test]
fn test_channels_served_in_rotation() {
    let mut h = with_buffers(8);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let c1 = h.attach(a, 0x40);
    let c2 = h.attach(a, 0x41);
    h.platform().power_pending = true;
    for _ in 0..2 {
        h.manager.send_channel_frame(c1, frame(10)).unwrap();
        h.manager.send_channel_frame(c2, frame(10)).unwrap();
    }

    h.platform().power_pending = false;
    h.manager.on_completed_packets(HciHandle(1), 0).unwrap();

    let order: Vec<_> = h.platform().sent.iter().map(|b| b.channel).collect();
    assert_eq!(order, vec![Some(c1), Some(c2), Some(c1), Some(c2)]);
}

#[test]
fn test_single_write_sends_exactly_one() {
    let mut h = with_buffers(8);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.platform().power_pending = true;
    h.manager.send_link_frame(a, frame(10)).unwrap();
    h.manager.send_link_frame(a, frame(10)).unwrap();
    h.platform().power_pending = false;

    h.manager.send_single(a, frame(10)).unwrap();

    assert_eq!(h.platform().sent.len(), 1);
    assert_eq!(h.manager.link(a).unwrap().link_queue.len(), 2);
}

#[test]
fn test_high_priority_ack_unblocks_round_robin() {
    let mut h = with_buffers(5);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let b = h.connected_link(addr(2), CLASSIC, 2);
    let c = h.connected_link(addr(3), CLASSIC, 3);
    let d = h.connected_link(addr(4), CLASSIC, 4);
    h.connected_link(addr(5), CLASSIC, 5);
    for remote in [addr(1), addr(2)] {
        h.manager
            .set_priority(remote, CLASSIC, LinkPriority::High)
            .unwrap();
    }
    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 2);
    assert_eq!(h.manager.flow(CLASSIC).rr_quota, 1);

    for id in [a, a, b, b, c] {
        h.manager.send_link_frame(id, frame(10)).unwrap();
    }
    h.manager.send_link_frame(d, frame(10)).unwrap();
    assert_eq!(h.manager.flow(CLASSIC).window, 0);
    assert_eq!(h.manager.link(d).unwrap().link_queue.len(), 1);

    // c goes away with its buffer; nothing pumps the shared pool
    h.manager
        .on_disconnect_complete(HciHandle(3), HciStatus::PEER_USER)
        .unwrap();
    assert_eq!(h.manager.link(d).unwrap().link_queue.len(), 1);

    h.manager.on_completed_packets(HciHandle(1), 1).unwrap();
    assert!(h.manager.link(d).unwrap().link_queue.is_empty());
}

#[test]
fn test_congestion_upcall_and_returned_frames() {
    let mut h = with_buffers(8);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    let cid = h.attach(a, 0x40);
    h.manager
        .set_channel_rates(cid, DataRate::NoTraffic, DataRate::NoTraffic)
        .unwrap();
    assert_eq!(h.manager.channel(cid).unwrap().buffer_quota, 0);

    h.platform().power_pending = true;
    h.manager.send_channel_frame(cid, frame(10)).unwrap();
    assert!(h.manager.channel(cid).unwrap().congested);

    {
        let mut p = h.platform();
        p.power_pending = false;
        p.congestion_frames = vec![frame(12)];
    }
    h.manager.on_completed_packets(HciHandle(1), 0).unwrap();

    let p = h.platform();
    assert_eq!(p.congestion, vec![(cid, true), (cid, false)]);
    assert_eq!(p.sent.len(), 2);
    assert_eq!(p.sent[1].buffer.payload().len(), 12);
}

#[test]
fn test_controller_buffers_rerun_allocation() {
    let mut h = with_buffers(2);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.connected_link(addr(2), CLASSIC, 2);
    h.connected_link(addr(3), CLASSIC, 3);
    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 0);

    h.manager.set_controller_buffers(CLASSIC, 9);

    assert_eq!(h.manager.flow(CLASSIC).window, 9);
    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 3);
    assert_eq!(h.manager.flow(CLASSIC).rr_quota, 0);
}

#[test]
fn test_transports_accounted_independently() {
    let mut h = with_buffers(4);
    let classic = h.connected_link(addr(1), CLASSIC, 1);
    let le = h.connected_link(addr(1), TransportKind::LowEnergy, 2);

    h.manager.send_link_frame(classic, frame(10)).unwrap();
    h.manager.send_link_frame(le, frame(600)).unwrap();

    assert_eq!(h.manager.flow(CLASSIC).window, 3);
    // 600 bytes at the default LE mtu of 251
    assert_eq!(h.manager.flow(TransportKind::LowEnergy).window, 8 - 3);
}

#[test]
fn test_last_link_gone_resets_flow() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.manager.send_link_frame(a, frame(10)).unwrap();

    h.manager
        .on_disconnect_complete(HciHandle(1), HciStatus::PEER_USER)
        .unwrap();

    let flow = h.manager.flow(CLASSIC);
    assert_eq!(flow.window, 4);
    assert_eq!(flow.rr_unacked, 0);
    assert_eq!(flow.active_links(), 0);
}

#[test]
fn test_stray_reports_rejected() {
    let mut h = with_buffers(4);
    assert_eq!(
        h.manager.on_completed_packets(HciHandle(0x55), 1),
        Err(LinkError::UnknownHandle(HciHandle(0x55)))
    );
    assert_eq!(
        h.manager.on_segments_transmitted(HciHandle(0x55), frame(10)),
        Err(LinkError::UnknownHandle(HciHandle(0x55)))
    );

    let a = h.manager.connect(addr(1), CLASSIC).unwrap();
    assert!(h.manager.link(a).is_some());
    assert_eq!(h.manager.flow(CLASSIC).window, 4);
}

#[test]
fn test_reallocation_arms_flow_control_retry() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    h.attach(a, 0x40);
    h.connected_link(addr(2), CLASSIC, 2);
    for _ in 0..3 {
        h.manager.send_link_frame(a, frame(10)).unwrap();
    }
    assert_eq!(h.manager.link(a).unwrap().link_queue.len(), 1);
    assert!(!h.manager.is_timer_armed(TimerKey::Link(a)));

    // the second link leaves: a's quota doubles with nothing acked yet
    h.manager
        .on_disconnect_complete(HciHandle(2), HciStatus::CONN_CAUSE_LOCAL_HOST)
        .unwrap();
    assert_eq!(h.manager.link(a).unwrap().xmit_quota, 4);
    assert_eq!(h.manager.link(a).unwrap().link_queue.len(), 1);
    assert!(h.manager.is_timer_armed(TimerKey::Link(a)));

    h.manager.on_timer_expired(TimerKey::Link(a));

    assert!(h.manager.link(a).unwrap().link_queue.is_empty());
    assert_eq!(h.platform().segments_sent(HciHandle(1)), 3);
    assert_eq!(h.manager.flow(CLASSIC).window, 1);
}

#[test]
fn test_flow_control_timer_sends_once_window_reopens() {
    let mut h = with_buffers(4);
    let a = h.connected_link(addr(1), CLASSIC, 1);
    for _ in 0..4 {
        h.manager.send_link_frame(a, frame(10)).unwrap();
    }
    assert_eq!(h.manager.flow(CLASSIC).window, 0);

    // b gets a private quota while a still holds the whole window
    let b = h.connected_link(addr(2), CLASSIC, 2);
    h.attach(b, 0x41);
    assert_eq!(h.manager.link(b).unwrap().xmit_quota, 2);
    h.manager.send_link_frame(b, frame(10)).unwrap();
    assert_eq!(h.platform().segments_sent(HciHandle(2)), 0);
    assert!(h.manager.is_timer_armed(TimerKey::Link(b)));

    // acks for a only pump a
    h.manager.on_completed_packets(HciHandle(1), 4).unwrap();
    assert_eq!(h.manager.flow(CLASSIC).window, 4);
    assert_eq!(h.manager.link(b).unwrap().link_queue.len(), 1);

    h.manager.on_timer_expired(TimerKey::Link(b));

    assert!(h.manager.link(b).unwrap().link_queue.is_empty());
    assert_eq!(h.platform().segments_sent(HciHandle(2)), 1);
}

#[test]
fn test_frames_queued_while_connecting_sent_on_connect() {
    let mut h = with_buffers(4);
    let a = h.manager.connect(addr(1), CLASSIC).unwrap();
    h.manager.send_link_frame(a, frame(10)).unwrap();
    h.manager.send_link_frame(a, frame(10)).unwrap();
    assert!(h.platform().sent.is_empty());

    h.manager
        .on_connection_complete(addr(1), CLASSIC, HciHandle(1), HciStatus::SUCCESS)
        .unwrap();

    assert!(h.manager.link(a).unwrap().link_queue.is_empty());
    assert_eq!(h.platform().segments_sent(HciHandle(1)), 2);
    assert_eq!(h.manager.link(a).unwrap().sent_not_acked, 2);
}
