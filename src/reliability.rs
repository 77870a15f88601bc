//! Control-channel reliability.
//!
//! The control channel runs reliable, in-order delivery over the unreliable
//! transport:
//!
//! - Monotonic packet ids with a bounded send window and retransmission at
//!   an exponentially backed-off interval
//! - ACKs piggy-backed on outgoing control packets or sent standalone
//! - A sliding replay window (bitmap + high-water mark) on receive
//! - A small reorder buffer reconstructing in-order delivery

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Error, ErrorCode, Result};

/// Maximum outstanding unacknowledged control messages.
pub const SEND_WINDOW: usize = 8;

/// Replay window size in packet ids.
pub const REPLAY_WINDOW: u64 = 64;

/// Receive reorder buffer size in packet ids.
pub const RECV_WINDOW: u32 = 8;

/// Initial retransmission interval.
pub const RETRANSMIT_BASE: Duration = Duration::from_secs(2);

/// Retransmission interval cap.
pub const RETRANSMIT_CAP: Duration = Duration::from_secs(60);

/// Maximum ACK ids piggy-backed on one packet header.
pub const MAX_ACKS_PER_PACKET: usize = 4;

/// Monotonic packet-id source for one direction of one key context.
#[derive(Debug)]
pub struct PacketIdSend {
    next: u32,
}

impl PacketIdSend {
    /// Ids start at 1; 0 is invalid on the wire.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next id. Exhausting the 32-bit space forces a rekey.
    pub fn next_id(&mut self) -> Result<u32> {
        if self.next == u32::MAX {
            return Err(Error::tagged(
                ErrorCode::PktidExpire,
                "packet id space exhausted",
            ));
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Id the next call will return.
    pub fn peek(&self) -> u32 {
        self.next
    }
}

impl Default for PacketIdSend {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding replay window: a 64-bit bitmap keyed off `high_water - id`.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    high_water: u64,
    bitmap: u64,
}

impl ReplayWindow {
    /// An empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test an incoming id and record it when acceptable.
    ///
    /// Accepts ids strictly above the low-water mark that have not been seen;
    /// on acceptance the seen bit is set and the window slides.
    pub fn test_add(&mut self, id: u64) -> std::result::Result<(), ErrorCode> {
        if id == 0 {
            return Err(ErrorCode::PktidInvalid);
        }
        if id > self.high_water {
            let shift = id - self.high_water;
            self.bitmap = if shift >= REPLAY_WINDOW {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.high_water = id;
            return Ok(());
        }
        let offset = self.high_water - id;
        if offset >= REPLAY_WINDOW {
            return Err(ErrorCode::PktidBacktrack);
        }
        let bit = 1u64 << offset;
        if self.bitmap & bit != 0 {
            return Err(ErrorCode::PktidReplay);
        }
        self.bitmap |= bit;
        Ok(())
    }

    /// Highest id accepted so far.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }
}

struct PendingSend {
    data: Bytes,
    retries: u32,
    interval: Duration,
    next_retry: Instant,
}

/// Outgoing reliable messages awaiting acknowledgment.
pub struct SendReliable {
    pending: BTreeMap<u32, PendingSend>,
}

impl SendReliable {
    /// An empty send window.
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Track a freshly sent message for retransmission.
    ///
    /// Scheduling beyond the window bound is a control-channel error.
    pub fn schedule(&mut self, packet_id: u32, data: Bytes, now: Instant) -> Result<()> {
        if self.pending.len() >= SEND_WINDOW {
            return Err(Error::ControlChannel(format!(
                "send window full ({SEND_WINDOW} outstanding)"
            )));
        }
        self.pending.insert(
            packet_id,
            PendingSend {
                data,
                retries: 0,
                interval: RETRANSMIT_BASE,
                next_retry: now + RETRANSMIT_BASE,
            },
        );
        Ok(())
    }

    /// Drop entries covered by received ACK ids.
    pub fn on_ack(&mut self, acked: &[u32]) {
        for id in acked {
            self.pending.remove(id);
        }
    }

    /// Messages due for retransmission at `now`. Each returned message's
    /// backoff doubles, capped at [`RETRANSMIT_CAP`].
    pub fn due_retransmits(&mut self, now: Instant) -> Vec<(u32, Bytes)> {
        let mut due = Vec::new();
        for (&id, entry) in self.pending.iter_mut() {
            if now >= entry.next_retry {
                entry.retries += 1;
                entry.interval = (entry.interval * 2).min(RETRANSMIT_CAP);
                entry.next_retry = now + entry.interval;
                due.push((id, entry.data.clone()));
            }
        }
        due
    }

    /// Earliest retransmission deadline, if anything is outstanding.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.values().map(|e| e.next_retry).min()
    }

    /// Outstanding message count.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether everything sent has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for SendReliable {
    fn default() -> Self {
        Self::new()
    }
}

/// Incoming reliable stream reassembly.
pub struct RecvReliable {
    next_expected: u32,
    reorder: BTreeMap<u32, Bytes>,
    replay: ReplayWindow,
}

impl RecvReliable {
    /// An empty receive window expecting id 1.
    pub fn new() -> Self {
        Self {
            next_expected: 1,
            reorder: BTreeMap::new(),
            replay: ReplayWindow::new(),
        }
    }

    /// Accept an incoming control payload.
    ///
    /// Returns the in-order payloads this packet released. Replays and ids
    /// outside the reorder window are reported as the specific packet-id
    /// error; the caller counts and drops them.
    pub fn receive(
        &mut self,
        packet_id: u32,
        data: Bytes,
    ) -> std::result::Result<Vec<Bytes>, ErrorCode> {
        self.replay.test_add(packet_id as u64)?;

        if packet_id < self.next_expected {
            // Already delivered; replay window normally catches this first.
            return Ok(Vec::new());
        }
        if packet_id >= self.next_expected + RECV_WINDOW {
            return Err(ErrorCode::PktidBacktrack);
        }

        self.reorder.insert(packet_id, data);

        let mut delivered = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.next_expected) {
            delivered.push(payload);
            self.next_expected += 1;
        }
        Ok(delivered)
    }

    /// Next id the stream is waiting for.
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }
}

impl Default for RecvReliable {
    fn default() -> Self {
        Self::new()
    }
}

/// Received packet ids waiting to be acknowledged.
#[derive(Default)]
pub struct AckQueue {
    pending: VecDeque<u32>,
}

impl AckQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an id for acknowledgment.
    pub fn push(&mut self, packet_id: u32) {
        if !self.pending.contains(&packet_id) {
            self.pending.push_back(packet_id);
        }
    }

    /// Take up to [`MAX_ACKS_PER_PACKET`] ids to piggy-back on an outgoing
    /// header.
    pub fn take_batch(&mut self) -> Vec<u32> {
        let n = self.pending.len().min(MAX_ACKS_PER_PACKET);
        self.pending.drain(..n).collect()
    }

    /// Whether any acknowledgments are waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of waiting acknowledgments.
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_monotonic() {
        let mut ids = PacketIdSend::new();
        assert_eq!(ids.next_id().unwrap(), 1);
        assert_eq!(ids.next_id().unwrap(), 2);
        assert_eq!(ids.peek(), 3);
    }

    #[test]
    fn test_packet_id_exhaustion() {
        let mut ids = PacketIdSend { next: u32::MAX };
        let err = ids.next_id().unwrap_err();
        assert_eq!(err.code(), ErrorCode::PktidExpire);
    }

    #[test]
    fn test_replay_window_in_order() {
        let mut win = ReplayWindow::new();
        for id in 1..=100 {
            win.test_add(id).unwrap();
        }
        assert_eq!(win.high_water(), 100);
    }

    #[test]
    fn test_replay_window_rejects_duplicates() {
        let mut win = ReplayWindow::new();
        win.test_add(5).unwrap();
        assert_eq!(win.test_add(5), Err(ErrorCode::PktidReplay));

        // Out-of-order but fresh is fine.
        win.test_add(3).unwrap();
        assert_eq!(win.test_add(3), Err(ErrorCode::PktidReplay));
    }

    #[test]
    fn test_replay_window_backtrack() {
        let mut win = ReplayWindow::new();
        win.test_add(200).unwrap();
        // 200 - 64 = 136 is the oldest representable slot.
        win.test_add(137).unwrap();
        assert_eq!(win.test_add(136), Err(ErrorCode::PktidBacktrack));
        assert_eq!(win.test_add(1), Err(ErrorCode::PktidBacktrack));
    }

    #[test]
    fn test_replay_window_invalid_zero() {
        let mut win = ReplayWindow::new();
        assert_eq!(win.test_add(0), Err(ErrorCode::PktidInvalid));
    }

    #[test]
    fn test_replay_window_big_jump_clears_bitmap() {
        let mut win = ReplayWindow::new();
        win.test_add(1).unwrap();
        win.test_add(1000).unwrap();
        assert_eq!(win.high_water(), 1000);
        win.test_add(999).unwrap();
    }

    #[test]
    fn test_send_window_bound() {
        let now = Instant::now();
        let mut send = SendReliable::new();
        for id in 1..=SEND_WINDOW as u32 {
            send.schedule(id, Bytes::from_static(b"m"), now).unwrap();
        }
        let err = send
            .schedule(99, Bytes::from_static(b"overflow"), now)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CcError);
    }

    #[test]
    fn test_ack_clears_pending() {
        let now = Instant::now();
        let mut send = SendReliable::new();
        send.schedule(1, Bytes::from_static(b"a"), now).unwrap();
        send.schedule(2, Bytes::from_static(b"b"), now).unwrap();
        send.on_ack(&[1]);
        assert_eq!(send.len(), 1);
        send.on_ack(&[2, 7]);
        assert!(send.is_empty());
        assert!(send.next_timeout().is_none());
    }

    #[test]
    fn test_retransmit_backoff() {
        let now = Instant::now();
        let mut send = SendReliable::new();
        send.schedule(1, Bytes::from_static(b"a"), now).unwrap();

        // Not yet due.
        assert!(send.due_retransmits(now).is_empty());

        // Due after the base interval; backoff doubles each time.
        let t1 = now + RETRANSMIT_BASE;
        assert_eq!(send.due_retransmits(t1).len(), 1);
        assert!(send.due_retransmits(t1).is_empty());

        let t2 = t1 + RETRANSMIT_BASE * 2;
        assert_eq!(send.due_retransmits(t2).len(), 1);

        // Backoff never exceeds the cap.
        let far = now + Duration::from_secs(10_000);
        send.due_retransmits(far);
        let deadline = send.next_timeout().unwrap();
        assert!(deadline <= far + RETRANSMIT_CAP);
    }

    #[test]
    fn test_recv_in_order_delivery() {
        let mut recv = RecvReliable::new();
        let out = recv.receive(1, Bytes::from_static(b"one")).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"one")]);
        let out = recv.receive(2, Bytes::from_static(b"two")).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"two")]);
        assert_eq!(recv.next_expected(), 3);
    }

    #[test]
    fn test_recv_reorders() {
        let mut recv = RecvReliable::new();
        assert!(recv.receive(3, Bytes::from_static(b"three")).unwrap().is_empty());
        assert!(recv.receive(2, Bytes::from_static(b"two")).unwrap().is_empty());
        let out = recv.receive(1, Bytes::from_static(b"one")).unwrap();
        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ]
        );
    }

    #[test]
    fn test_recv_duplicate_and_window() {
        let mut recv = RecvReliable::new();
        recv.receive(1, Bytes::from_static(b"one")).unwrap();
        assert_eq!(
            recv.receive(1, Bytes::from_static(b"one")),
            Err(ErrorCode::PktidReplay)
        );
        // Too far ahead of the reorder window.
        assert_eq!(
            recv.receive(2 + RECV_WINDOW, Bytes::from_static(b"far")),
            Err(ErrorCode::PktidBacktrack)
        );
    }

    #[test]
    fn test_ack_queue_batching() {
        let mut acks = AckQueue::new();
        for id in 1..=6 {
            acks.push(id);
        }
        acks.push(3); // duplicate ignored
        assert_eq!(acks.len(), 6);

        let batch = acks.take_batch();
        assert_eq!(batch, vec![1, 2, 3, 4]);
        let batch = acks.take_batch();
        assert_eq!(batch, vec![5, 6]);
        assert!(acks.is_empty());
    }
}
