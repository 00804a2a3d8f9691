//! Load-compensated timeout for bulk data transfer.
//!
//! A device declares how long it needs to write one block. That budget does not
//! cover bus congestion: under heavy foreign traffic one round trip of a large
//! block can take far longer. The offset assumes 7 payload bytes per frame and
//! about 2 ms per frame at 100 kbit/s, times 5 for contention, which reduces to
//! `len * 10 / 7` ms at the slowest bitrate.

/// Slowest bitrate the adapter scales against
pub const SLOWEST_BITRATE_KBIT: u32 = 100;

/// Timeout for one TransferData round trip carrying `max_block_length` bytes.
///
/// A bitrate of 0 is invalid and treated as 100 kbit/s.
pub fn adapted_transfer_timeout(base_timeout_ms: u32, max_block_length: u32, bitrate_kbit: u32) -> u32 {
    let bitrate = if bitrate_kbit == 0 {
        log::warn!(
            "[Timeout] Bitrate 0 is invalid, calculating with {} kbit/s",
            SLOWEST_BITRATE_KBIT
        );
        SLOWEST_BITRATE_KBIT
    } else {
        bitrate_kbit.max(SLOWEST_BITRATE_KBIT)
    };

    let offset_ms = (max_block_length as u64 * 10) / 7;
    let scaled_ms = offset_ms * SLOWEST_BITRATE_KBIT as u64 / bitrate as u64;
    let total = base_timeout_ms as u64 + scaled_ms;
    total.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        // 4095 bytes at 100 kbit/s: 4095 * 10 / 7 = 5850
        assert_eq!(adapted_transfer_timeout(1000, 4095, 100), 6850);
        // same block at 500 kbit/s: 5850 / 5 = 1170
        assert_eq!(adapted_transfer_timeout(1000, 4095, 500), 2170);
        assert_eq!(adapted_transfer_timeout(250, 0, 1000), 250);
    }

    #[test]
    fn test_zero_bitrate_same_as_slowest() {
        for len in [0, 7, 255, 4095, 65_535] {
            assert_eq!(
                adapted_transfer_timeout(1000, len, 0),
                adapted_transfer_timeout(1000, len, 100)
            );
        }
    }

    #[test]
    fn test_below_slowest_bitrate_not_scaled_up() {
        assert_eq!(
            adapted_transfer_timeout(1000, 4095, 50),
            adapted_transfer_timeout(1000, 4095, 100)
        );
    }

    #[test]
    fn test_monotonic_in_block_length() {
        for bitrate in [100, 125, 250, 500, 1000] {
            let mut previous = 0;
            for len in (0..=8192).step_by(37) {
                let t = adapted_transfer_timeout(500, len, bitrate);
                assert!(t >= previous, "len {} bitrate {}", len, bitrate);
                previous = t;
            }
        }
    }

    #[test]
    fn test_non_increasing_in_bitrate() {
        for len in [1, 100, 4095, 20_000] {
            let mut previous = u32::MAX;
            for bitrate in (100..=2000).step_by(25) {
                let t = adapted_transfer_timeout(500, len, bitrate);
                assert!(t <= previous, "len {} bitrate {}", len, bitrate);
                previous = t;
            }
        }
    }

    #[test]
    fn test_saturates() {
        assert_eq!(adapted_transfer_timeout(u32::MAX, u32::MAX, 100), u32::MAX);
    }
}
