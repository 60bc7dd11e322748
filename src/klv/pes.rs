//! PES framing and KLV unit extraction: start-code check, stream ID
//! allow-list, header-length offset arithmetic, and the SMPTE 336M UAS
//! Local Set Universal Key check.
use bytes::Bytes;

/// SMPTE 336M UAS Local Set Universal Key.
pub const UAS_KEY: [u8; 16] = [
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00,
];

const PRIVATE_STREAM_1: u8 = 0xBD;
const METADATA_STREAM: u8 = 0xFC;

/// Given a completed PES payload for a KLV PID, extract the embedded KLV
/// unit if the frame is well-formed and its payload begins with the UAS
/// key. Returns `None` on any rejection (short/malformed PES, disallowed
/// stream ID, out-of-range header length, or a non-matching key).
pub fn extract_klv_unit(pes: &[u8]) -> Option<Bytes> {
    if pes.len() < 9 {
        return None;
    }
    if pes[0] != 0x00 || pes[1] != 0x00 || pes[2] != 0x01 {
        return None;
    }

    let stream_id = pes[3];
    if stream_id != PRIVATE_STREAM_1 && stream_id != METADATA_STREAM {
        return None;
    }

    let pes_header_data_length = pes[8] as usize;
    let klv_offset = 9 + pes_header_data_length;
    if klv_offset > pes.len() {
        return None;
    }

    let payload = &pes[klv_offset..];
    if payload.len() < UAS_KEY.len() {
        return None;
    }
    if payload[..UAS_KEY.len()] != UAS_KEY {
        return None;
    }

    Some(Bytes::copy_from_slice(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pes(stream_id: u8, header_data_len: u8, payload: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x00, header_data_len];
        pes.extend(std::iter::repeat(0u8).take(header_data_len as usize));
        pes.extend_from_slice(payload);
        pes
    }

    fn klv_payload() -> Vec<u8> {
        let mut v = UAS_KEY.to_vec();
        v.extend(std::iter::repeat(0xAAu8).take(100));
        v
    }

    #[test]
    fn valid_klv_pes_is_extracted() {
        let payload = klv_payload();
        let pes = build_pes(0xFC, 0, &payload);
        let out = extract_klv_unit(&pes).expect("should extract");
        assert_eq!(out.len(), payload.len());
        assert_eq!(&out[..16], &UAS_KEY[..]);
    }

    #[test]
    fn private_stream_1_is_also_accepted() {
        let payload = klv_payload();
        let pes = build_pes(0xBD, 0, &payload);
        assert!(extract_klv_unit(&pes).is_some());
    }

    #[test]
    fn disallowed_stream_id_is_rejected() {
        let payload = klv_payload();
        let pes = build_pes(0xE0, 0, &payload); // video stream id
        assert!(extract_klv_unit(&pes).is_none());
    }

    #[test]
    fn bad_start_code_is_rejected() {
        let mut pes = build_pes(0xFC, 0, &klv_payload());
        pes[2] = 0x02;
        assert!(extract_klv_unit(&pes).is_none());
    }

    #[test]
    fn too_short_pes_is_rejected() {
        let pes = vec![0x00, 0x00, 0x01, 0xFC];
        assert!(extract_klv_unit(&pes).is_none());
    }

    #[test]
    fn header_data_length_offset_is_honored() {
        let payload = klv_payload();
        let pes = build_pes(0xFC, 5, &payload);
        let out = extract_klv_unit(&pes).expect("should extract despite stuffing bytes");
        assert_eq!(&out[..16], &UAS_KEY[..]);
    }

    #[test]
    fn out_of_range_header_length_is_rejected() {
        let mut pes = build_pes(0xFC, 0, &klv_payload());
        pes[8] = 250;
        assert!(extract_klv_unit(&pes).is_none());
    }

    #[test]
    fn non_matching_key_is_rejected() {
        let mut payload = vec![0u8; 116];
        payload[0] = 0xFF; // corrupt the key
        let pes = build_pes(0xFC, 0, &payload);
        assert!(extract_klv_unit(&pes).is_none());
    }
}
