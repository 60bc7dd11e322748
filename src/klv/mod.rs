//! KLV Demultiplexer: reassembles KLV PES payloads from TS packets on
//! known KLV PIDs, independently of the video decode path, and emits
//! validated KLV units on a broadcast channel.
pub mod pes;
pub mod ts;

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Known STANAG 4609 KLV PIDs. Packets on any other PID are ignored.
pub const KNOWN_KLV_PIDS: [u16; 7] = [0x0042, 0x0044, 0x0100, 0x0101, 0x0102, 0x01F1, 0x1000];

/// Per-PID PES reassembly guard: slots are discarded rather than allowed
/// to grow without bound.
pub const MAX_REASSEMBLY_BYTES: usize = 64 * 1024;

fn is_known_klv_pid(pid: u16) -> bool {
    KNOWN_KLV_PIDS.contains(&pid)
}

/// Owns the per-PID reassembly slots and the KLV event channel.
/// Single-owner (the KLV demux thread); no cross-thread access to the
/// slots themselves.
pub struct KlvDemultiplexer {
    slots: HashMap<u16, BytesMut>,
    tx: broadcast::Sender<Bytes>,
}

impl KlvDemultiplexer {
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity);
        Self {
            slots: HashMap::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Process one 188-byte TS packet. Malformed packets and packets on
    /// unknown PIDs are silently discarded (per-packet recovery).
    pub fn process_packet(&mut self, packet: &[u8]) {
        let Some((header, offset)) = ts::parse_header(packet) else {
            return;
        };

        if !is_known_klv_pid(header.pid) {
            return;
        }

        let payload = &packet[offset..];

        if header.pusi {
            if let Some(closed) = self.slots.remove(&header.pid) {
                if !closed.is_empty() {
                    self.emit_if_valid(&closed);
                }
            }
            if payload.len() > MAX_REASSEMBLY_BYTES {
                warn!(pid = header.pid, size = payload.len(), "KLV reassembly slot exceeded cap on first packet, discarding");
                return;
            }
            let mut slot = BytesMut::with_capacity(payload.len());
            slot.extend_from_slice(payload);
            self.slots.insert(header.pid, slot);
        } else if let Some(slot) = self.slots.get_mut(&header.pid) {
            if slot.len() + payload.len() > MAX_REASSEMBLY_BYTES {
                warn!(pid = header.pid, size = slot.len() + payload.len(), "KLV reassembly slot would exceed cap, discarding");
                self.slots.remove(&header.pid);
                return;
            }
            slot.extend_from_slice(payload);
        } else {
            // Payload for a PID we haven't seen a PUSI for yet; nothing to
            // append to. Drop silently, matching per-packet recovery.
            trace!(pid = header.pid, "dropping payload with no open reassembly slot");
        }
    }

    /// Frame and emit every remaining open slot. The last PES per PID
    /// only closes when the *next* PUSI arrives (`process_packet`), so
    /// without this call the final unit on each PID is lost at session
    /// end. Call once, at session teardown.
    pub fn flush(&mut self) {
        for (_, slot) in self.slots.drain() {
            if !slot.is_empty() {
                self.emit_if_valid(&slot);
            }
        }
    }

    fn emit_if_valid(&self, pes_payload: &[u8]) {
        if let Some(unit) = pes::extract_klv_unit(pes_payload) {
            debug!(len = unit.len(), "emitting KLV unit");
            // No subscribers is not an error: the channel simply has
            // nothing to deliver to yet.
            let _ = self.tx.send(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; ts::TS_PACKET_LEN];
        packet[0] = ts::SYNC_BYTE;
        packet[1] = if pusi { 0x40 } else { 0 } | ((pid >> 8) as u8 & 0x1f);
        packet[2] = (pid & 0xff) as u8;
        packet[3] = 0b0001_0001; // payload only, cc=1
        let n = payload.len().min(184);
        packet[4..4 + n].copy_from_slice(&payload[..n]);
        packet
    }

    fn pes_with_klv(payload_tail: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xFC, 0x00, 0x00, 0x80, 0x00, 0x00];
        pes.extend_from_slice(&pes::UAS_KEY);
        pes.extend_from_slice(payload_tail);
        pes
    }

    #[test]
    fn unknown_pid_is_ignored() {
        let mut demux = KlvDemultiplexer::new(16);
        let pes = pes_with_klv(&[0xAA; 100]);
        demux.process_packet(&ts_packet(0x0043, true, &pes));
        assert!(demux.slots.is_empty());
    }

    #[test]
    fn single_packet_pes_emits_on_next_pusi() {
        let mut demux = KlvDemultiplexer::new(16);
        let mut rx = demux.subscribe();
        let pes = pes_with_klv(&[0xAA; 100]);
        assert!(pes.len() <= 184, "fits in one TS packet for this test");

        demux.process_packet(&ts_packet(0x01F1, true, &pes));
        // Nothing emitted yet: the slot only closes (and is framed) when
        // the *next* PUSI arrives for that PID.
        assert!(rx.try_recv().is_err());

        demux.process_packet(&ts_packet(0x01F1, true, &pes_with_klv(&[0xBB; 10])));
        let unit = rx.try_recv().expect("unit emitted on second PUSI");
        assert_eq!(&unit[..16], &pes::UAS_KEY[..]);
        assert_eq!(unit.len(), 116);
    }

    #[test]
    fn multi_packet_reassembly_across_continuation_packets() {
        let mut demux = KlvDemultiplexer::new(16);
        let mut rx = demux.subscribe();

        let mut pes = vec![0x00, 0x00, 0x01, 0xFC, 0x00, 0x00, 0x80, 0x00, 0x00];
        pes.extend_from_slice(&pes::UAS_KEY);
        pes.extend(std::iter::repeat(0xAAu8).take(300)); // forces >1 TS packet

        let mut remaining = &pes[..];
        let mut first = true;
        while !remaining.is_empty() {
            let n = remaining.len().min(184);
            let chunk = &remaining[..n];
            demux.process_packet(&ts_packet(0x01F1, first, chunk));
            remaining = &remaining[n..];
            first = false;
        }
        // Close it with a following PUSI packet (can be empty-ish payload).
        demux.process_packet(&ts_packet(0x01F1, true, &pes_with_klv(&[])));

        let unit = rx.try_recv().expect("reassembled unit emitted");
        assert_eq!(unit.len(), 16 + 300);
    }

    #[test]
    fn oversized_slot_is_discarded() {
        let mut demux = KlvDemultiplexer::new(16);
        demux.process_packet(&ts_packet(0x01F1, true, &[0u8; 184]));
        for _ in 0..400 {
            demux.process_packet(&ts_packet(0x01F1, false, &[0u8; 184]));
        }
        assert!(!demux.slots.contains_key(&0x01F1));
    }

    #[test]
    fn flush_emits_the_last_open_slot() {
        let mut demux = KlvDemultiplexer::new(16);
        let mut rx = demux.subscribe();
        let pes = pes_with_klv(&[0xAA; 100]);

        demux.process_packet(&ts_packet(0x01F1, true, &pes));
        // No following PUSI for this PID, so nothing is emitted yet.
        assert!(rx.try_recv().is_err());

        demux.flush();
        let unit = rx.try_recv().expect("flush emits the open slot");
        assert_eq!(&unit[..16], &pes::UAS_KEY[..]);
        assert!(demux.slots.is_empty());
    }

    #[test]
    fn flush_on_empty_demultiplexer_does_not_panic() {
        let mut demux = KlvDemultiplexer::new(16);
        demux.flush();
    }

    #[test]
    fn no_subscribers_does_not_panic_on_send() {
        let mut demux = KlvDemultiplexer::new(16);
        let pes = pes_with_klv(&[0xAA; 10]);
        demux.process_packet(&ts_packet(0x01F1, true, &pes));
        demux.process_packet(&ts_packet(0x01F1, true, &pes_with_klv(&[])));
        // No assertion needed: this must simply not panic with zero
        // subscribers attached.
    }
}
