//! Library-level round-trip test for the KLV Demultiplexer (§8 round-trip
//! law): a TS stream carrying a PES on PID 0x01F1 whose payload is
//! `UASKEY || X` should emit `UASKEY || X` exactly once per PES, and a
//! PID outside the known set should never yield a KLV event.
use sync_core::klv::pes::UAS_KEY;
use sync_core::klv::ts::{SYNC_BYTE, TS_PACKET_LEN};
use sync_core::klv::KlvDemultiplexer;

fn ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; TS_PACKET_LEN];
    packet[0] = SYNC_BYTE;
    packet[1] = if pusi { 0x40 } else { 0 } | ((pid >> 8) as u8 & 0x1f);
    packet[2] = (pid & 0xff) as u8;
    packet[3] = 0b0001_0001; // payload-only, continuity counter = 1
    let n = payload.len().min(184);
    packet[4..4 + n].copy_from_slice(&payload[..n]);
    packet
}

fn pes_frame(payload: &[u8]) -> Vec<u8> {
    let mut pes = vec![0x00, 0x00, 0x01, 0xFC, 0x00, 0x00, 0x80, 0x00, 0x00];
    pes.extend_from_slice(payload);
    pes
}

/// Feed one PES payload as however many TS packets it takes, closing the
/// reassembly with a trailing PUSI packet so the slot is handed to the
/// PES framer.
fn feed_pes(demux: &mut KlvDemultiplexer, pid: u16, pes: &[u8]) {
    let mut remaining = pes;
    let mut first = true;
    while !remaining.is_empty() {
        let n = remaining.len().min(184);
        demux.process_packet(&ts_packet(pid, first, &remaining[..n]));
        remaining = &remaining[n..];
        first = false;
    }
}

#[test]
fn five_one_second_pes_units_yield_five_klv_events() {
    let mut demux = KlvDemultiplexer::new(16);
    let mut rx = demux.subscribe();

    let mut payload = UAS_KEY.to_vec();
    payload.extend(std::iter::repeat(0xAAu8).take(100));
    let pes = pes_frame(&payload);

    // Five PES units on the KLV PID. The first four close when the next
    // one's PUSI arrives; the fifth only closes on `flush()` at session
    // end, since no sixth PES ever arrives to close it.
    for _ in 0..5 {
        feed_pes(&mut demux, 0x01F1, &pes);
    }
    demux.flush();

    let mut events = Vec::new();
    while let Ok(unit) = rx.try_recv() {
        events.push(unit);
    }

    assert_eq!(events.len(), 5);
    for unit in &events {
        assert_eq!(unit.len(), 116);
        assert_eq!(&unit[..16], &UAS_KEY[..]);
    }
}

#[test]
fn pid_0x0043_never_yields_a_klv_event() {
    let mut demux = KlvDemultiplexer::new(16);
    let mut rx = demux.subscribe();

    let mut payload = UAS_KEY.to_vec();
    payload.extend(std::iter::repeat(0xAAu8).take(50));
    let pes = pes_frame(&payload);

    feed_pes(&mut demux, 0x0043, &pes);
    demux.flush();

    assert!(rx.try_recv().is_err());
}

#[test]
fn non_uas_key_prefix_is_rejected() {
    let mut demux = KlvDemultiplexer::new(16);
    let mut rx = demux.subscribe();

    let mut payload = vec![0u8; 16]; // all zero, not the UAS key
    payload.extend(std::iter::repeat(0xBBu8).take(20));
    let pes = pes_frame(&payload);

    feed_pes(&mut demux, 0x01F1, &pes);
    demux.flush();

    assert!(rx.try_recv().is_err());
}
