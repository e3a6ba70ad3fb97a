//! Frame extraction out of a [`ByteRing`], honoring the length byte at
//! offset 2 (`slave | fc | byte_count | data(byte_count) | crc(2)`).
//!
//! The extractor pops the three header bytes before confirming the rest of
//! the frame is already in the ring. If it isn't, those bytes are lost.
//! This mirrors the behavior of the server this gateway was modeled on and
//! is preserved deliberately rather than fixed.

use crate::protocol::ring::ByteRing;

/// Drain up to `n` complete frames from `ring`, left to right.
pub fn extract(ring: &ByteRing, n: usize, max_retries: u32) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut retries = 0u32;

    if ring.length() < 3 {
        return frames;
    }

    while frames.len() < n {
        if ring.length() < 3 {
            break;
        }

        let mut scratch = Vec::with_capacity(3);
        for _ in 0..3 {
            match ring.dequeue() {
                Some(b) => scratch.push(b),
                None => {
                    // Ring emptied out from under us mid-peel; nothing to recover.
                    return frames;
                }
            }
        }

        let byte_count = scratch[2] as usize;
        let remaining_needed = byte_count + 2;

        if ring.length() < remaining_needed {
            // The header bytes are already gone. Observed/preserved loss.
            break;
        }

        let mut ok = true;
        for _ in 0..remaining_needed {
            match ring.dequeue() {
                Some(b) => scratch.push(b),
                None => {
                    ok = false;
                    break;
                }
            }
        }

        if !ok {
            retries += 1;
            if retries > max_retries {
                break;
            }
            continue;
        }

        frames.push(scratch);
    }

    frames
}

/// Hex-encode frames for the external JSON interface.
pub fn to_hex_strings(frames: Vec<Vec<u8>>) -> Vec<String> {
    frames
        .into_iter()
        .map(|frame| frame.iter().map(|b| format!("{b:02x}")).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preload(ring: &ByteRing, bytes: &[u8]) {
        for &b in bytes {
            assert!(ring.enqueue(b));
        }
    }

    fn hex_to_bytes(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn single_complete_frame() {
        let bytes = hex_to_bytes("01030800010001000000193ba7");
        let ring = ByteRing::new(64);
        preload(&ring, &bytes);

        let frames = extract(&ring, 1, 3);
        assert_eq!(frames.len(), 1);
        assert_eq!(to_hex_strings(frames), vec!["01030800010001000000193ba7"]);
        assert_eq!(ring.length(), 0);
    }

    #[test]
    fn insufficient_bytes_loses_header() {
        let bytes = hex_to_bytes("01030800010001000000193ba7");
        let ring = ByteRing::new(64);
        preload(&ring, &bytes[..10]);

        let frames = extract(&ring, 1, 3);
        assert!(frames.is_empty());
        assert_eq!(ring.length(), 7);
    }

    #[test]
    fn two_frames_requested_one_returned_when_only_one_present() {
        let bytes = hex_to_bytes("01030800010001000000193ba7");
        let ring = ByteRing::new(64);
        preload(&ring, &bytes);

        let frames = extract(&ring, 2, 3);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn n_frames_concatenated_returns_exactly_n() {
        let one = hex_to_bytes("01030800010001000000193ba7");
        let mut bytes = one.clone();
        bytes.extend_from_slice(&one);
        let ring = ByteRing::new(128);
        preload(&ring, &bytes);

        let frames = extract(&ring, 2, 3);
        assert_eq!(frames.len(), 2);
        assert_eq!(ring.length(), 0);
    }

    #[test]
    fn empty_ring_returns_empty() {
        let ring = ByteRing::new(64);
        assert!(extract(&ring, 1, 3).is_empty());
    }
}
