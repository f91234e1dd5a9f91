//! Block checksum primitives.
//!
//! All chunk payload is checksummed in fixed-size blocks; the chunk file
//! header carries one CRC32C per block plus a checksum of the serialized
//! header record itself.

/// CRC32C of one buffer.
pub fn compute_block_checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// CRC32C widened to the 64-bit slot the header trailer uses.
pub fn compute_header_checksum(record: &[u8]) -> u64 {
    crc32c::crc32c(record) as u64
}

/// Per-block checksums over `data`, which must be a whole number of
/// `block_size` blocks (callers zero-pad the tail beforehand).
pub fn compute_checksums(data: &[u8], block_size: usize) -> Vec<u32> {
    debug_assert!(block_size > 0);
    debug_assert_eq!(data.len() % block_size, 0);
    data.chunks(block_size).map(crc32c::crc32c).collect()
}

/// Checksum of an all-zero block; used for the sparse-chunk allowance.
pub fn null_block_checksum(block_size: usize) -> u32 {
    crc32c::crc32c(&vec![0u8; block_size])
}

/// Zero-pad `buf` up to the next multiple of `block_size`.
pub fn zero_pad(buf: &mut Vec<u8>, block_size: usize) {
    let rem = buf.len() % block_size;
    if rem != 0 {
        buf.resize(buf.len() + (block_size - rem), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 4096;

    #[test]
    fn test_block_checksum_stable() {
        let a = compute_block_checksum(b"chunk payload");
        let b = compute_block_checksum(b"chunk payload");
        assert_eq!(a, b);
        assert_ne!(a, compute_block_checksum(b"chunk payloae"));
    }

    #[test]
    fn test_compute_checksums_per_block() {
        let mut data = vec![0u8; 2 * BLOCK];
        data[BLOCK] = 1;
        let sums = compute_checksums(&data, BLOCK);
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0], null_block_checksum(BLOCK));
        assert_ne!(sums[1], sums[0]);
    }

    #[test]
    fn test_null_block_checksum_matches_zeroed() {
        let zeros = vec![0u8; BLOCK];
        assert_eq!(null_block_checksum(BLOCK), compute_block_checksum(&zeros));
    }

    #[test]
    fn test_zero_pad() {
        let mut buf = vec![1u8; 100];
        zero_pad(&mut buf, BLOCK);
        assert_eq!(buf.len(), BLOCK);
        assert_eq!(buf[99], 1);
        assert_eq!(buf[100], 0);

        let mut aligned = vec![1u8; BLOCK];
        zero_pad(&mut aligned, BLOCK);
        assert_eq!(aligned.len(), BLOCK);
    }

    #[test]
    fn test_header_checksum_widening() {
        let sum = compute_header_checksum(b"record");
        assert_eq!(sum, crc32c::crc32c(b"record") as u64);
        assert!(sum <= u32::MAX as u64);
    }
}
