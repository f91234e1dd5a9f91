//! In-memory chunk metadata and the fixed-size on-disk header codec.
//!
//! Every chunk file starts with a serialized [`DiskChunkInfo`] record
//! followed by a 64-bit checksum of that record, zero-padded to the
//! configured header size. The payload starts at the header size offset.

use byteorder::{ByteOrder, LittleEndian};

use nimbus_types::{
    make_error_msg, ChunkCode, ChunkId, ChunkVersion, FileId, Result,
};

use crate::checksum::compute_header_checksum;

/// Magic tag at offset 0 of every chunk file.
pub const CHUNK_HEADER_MAGIC: u32 = 0x4e_43_4b_31; // "NCK1"

/// On-disk format version.
pub const CHUNK_HEADER_FMT_VERSION: u32 = 1;

/// Fixed part of the record: magic, fmt version, file id, chunk id,
/// chunk version, chunk size, block count.
const RECORD_FIXED_LEN: usize = 4 + 4 + 8 + 8 + 8 + 8 + 4;

/// Serialized record length for a given block count (excluding the
/// trailing checksum).
pub fn record_len(num_blocks: usize) -> usize {
    RECORD_FIXED_LEN + 4 * num_blocks
}

/// In-memory metadata of one hosted chunk.
///
/// `block_checksums` is `None` while the header has not been read from
/// disk (or has been unloaded on close); read and write paths require it
/// loaded.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub size: u64,
    pub block_checksums: Option<Vec<u32>>,
}

impl ChunkInfo {
    pub fn new(file_id: FileId, chunk_id: ChunkId, version: ChunkVersion) -> Self {
        Self {
            file_id,
            chunk_id,
            version,
            size: 0,
            block_checksums: None,
        }
    }

    pub fn checksums_loaded(&self) -> bool {
        self.block_checksums.is_some()
    }

    /// Allocate a zeroed checksum array sized for the chunk geometry.
    pub fn init_checksums(&mut self, num_blocks: usize) {
        if self.block_checksums.is_none() {
            self.block_checksums = Some(vec![0u32; num_blocks]);
        }
    }

    pub fn unload_checksums(&mut self) {
        self.block_checksums = None;
    }
}

/// The header record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskChunkInfo {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub size: u64,
    pub block_checksums: Vec<u32>,
}

impl DiskChunkInfo {
    /// Serialize the full header region: record, trailing checksum,
    /// zero padding up to `header_size`.
    pub fn serialize(&self, header_size: usize) -> Result<Vec<u8>> {
        let rec_len = record_len(self.block_checksums.len());
        if rec_len + 8 > header_size {
            return make_error_msg(
                ChunkCode::INVALID_ARG,
                format!(
                    "header record {} + checksum exceeds header size {}",
                    rec_len, header_size
                ),
            );
        }
        let mut buf = vec![0u8; header_size];
        LittleEndian::write_u32(&mut buf[0..4], CHUNK_HEADER_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], CHUNK_HEADER_FMT_VERSION);
        LittleEndian::write_u64(&mut buf[8..16], *self.file_id);
        LittleEndian::write_u64(&mut buf[16..24], *self.chunk_id);
        LittleEndian::write_u64(&mut buf[24..32], *self.version);
        LittleEndian::write_u64(&mut buf[32..40], self.size);
        LittleEndian::write_u32(&mut buf[40..44], self.block_checksums.len() as u32);
        let mut off = RECORD_FIXED_LEN;
        for sum in &self.block_checksums {
            LittleEndian::write_u32(&mut buf[off..off + 4], *sum);
            off += 4;
        }
        let checksum = compute_header_checksum(&buf[..rec_len]);
        LittleEndian::write_u64(&mut buf[off..off + 8], checksum);
        Ok(buf)
    }

    /// Parse and validate a header region previously produced by
    /// [`serialize`](Self::serialize).
    ///
    /// `require_checksum` forces header checksum verification even when
    /// the stored checksum slot is zero (the legacy "no checksum" marker).
    pub fn parse(
        buf: &[u8],
        max_blocks: usize,
        require_checksum: bool,
    ) -> Result<DiskChunkInfo> {
        if buf.len() < RECORD_FIXED_LEN + 8 {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("short chunk header: {} bytes", buf.len()),
            );
        }
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != CHUNK_HEADER_MAGIC {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("bad chunk header magic: {:#x}", magic),
            );
        }
        let fmt = LittleEndian::read_u32(&buf[4..8]);
        if fmt != CHUNK_HEADER_FMT_VERSION {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("unsupported chunk header format: {}", fmt),
            );
        }
        let num_blocks = LittleEndian::read_u32(&buf[40..44]) as usize;
        if num_blocks > max_blocks {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("block count {} exceeds limit {}", num_blocks, max_blocks),
            );
        }
        let rec_len = record_len(num_blocks);
        if buf.len() < rec_len + 8 {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("truncated chunk header: {} < {}", buf.len(), rec_len + 8),
            );
        }
        let stored = LittleEndian::read_u64(&buf[rec_len..rec_len + 8]);
        if stored != 0 || require_checksum {
            let computed = compute_header_checksum(&buf[..rec_len]);
            if computed != stored {
                return make_error_msg(
                    ChunkCode::BAD_HEADER_CHECKSUM,
                    format!(
                        "chunk header checksum mismatch: stored {} computed {}",
                        stored, computed
                    ),
                );
            }
        }
        let mut block_checksums = Vec::with_capacity(num_blocks);
        let mut off = RECORD_FIXED_LEN;
        for _ in 0..num_blocks {
            block_checksums.push(LittleEndian::read_u32(&buf[off..off + 4]));
            off += 4;
        }
        Ok(DiskChunkInfo {
            file_id: FileId(LittleEndian::read_u64(&buf[8..16])),
            chunk_id: ChunkId(LittleEndian::read_u64(&buf[16..24])),
            version: ChunkVersion(LittleEndian::read_u64(&buf[24..32])),
            size: LittleEndian::read_u64(&buf[32..40]),
            block_checksums,
        })
    }

    /// Cross-check identity against the values encoded in the file name.
    /// Unstable chunks are stored with version zero in both places.
    pub fn validate(&self, chunk_id: ChunkId, version: ChunkVersion) -> Result<()> {
        if self.chunk_id != chunk_id {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!("chunk id mismatch: header {} name {}", self.chunk_id, chunk_id),
            );
        }
        if version != ChunkVersion::UNSTABLE && self.version != version {
            return make_error_msg(
                ChunkCode::MALFORMED_CHUNK_FILE,
                format!(
                    "chunk version mismatch: header {} name {}",
                    self.version, version
                ),
            );
        }
        Ok(())
    }
}

/// Blindly corrupt a serialized header's record bytes; test helper for
/// checksum verification paths.
#[cfg(test)]
pub fn corrupt_record(buf: &mut [u8]) {
    buf[8] ^= 0xff;
}

/// Recompute the trailing checksum after patching a serialized header in
/// place.
pub fn reseal_header(buf: &mut [u8], num_blocks: usize) {
    let rec_len = record_len(num_blocks);
    let checksum = compute_header_checksum(&buf[..rec_len]);
    LittleEndian::write_u64(&mut buf[rec_len..rec_len + 8], checksum);
}

/// Convenience: whether a stored block checksum matches a freshly
/// computed one, honoring the sparse-chunk allowance.
pub fn block_checksum_matches(
    stored: u32,
    computed: u32,
    null_checksum: u32,
    allow_sparse: bool,
) -> bool {
    if stored == computed {
        return true;
    }
    allow_sparse && stored == 0 && computed == null_checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_SIZE: usize = 16 * 1024;
    const MAX_BLOCKS: usize = 1024;

    fn sample() -> DiskChunkInfo {
        DiskChunkInfo {
            file_id: FileId(7),
            chunk_id: ChunkId(42),
            version: ChunkVersion(3),
            size: 1_048_576,
            block_checksums: vec![0xdead_beef; 16],
        }
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let info = sample();
        let buf = info.serialize(HEADER_SIZE).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let parsed = DiskChunkInfo::parse(&buf, MAX_BLOCKS, true).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_serialize_is_bit_stable() {
        let info = sample();
        let a = info.serialize(HEADER_SIZE).unwrap();
        let b = info.serialize(HEADER_SIZE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let info = sample();
        let mut buf = info.serialize(HEADER_SIZE).unwrap();
        buf[0] = 0;
        let err = DiskChunkInfo::parse(&buf, MAX_BLOCKS, false).unwrap_err();
        assert_eq!(err.code(), ChunkCode::MALFORMED_CHUNK_FILE);
    }

    #[test]
    fn test_parse_detects_checksum_mismatch() {
        let info = sample();
        let mut buf = info.serialize(HEADER_SIZE).unwrap();
        corrupt_record(&mut buf);
        let err = DiskChunkInfo::parse(&buf, MAX_BLOCKS, false).unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_HEADER_CHECKSUM);
    }

    #[test]
    fn test_parse_zero_checksum_only_with_requirement() {
        let info = sample();
        let mut buf = info.serialize(HEADER_SIZE).unwrap();
        // Zero the stored checksum: legacy "no checksum" marker.
        let rec_len = record_len(info.block_checksums.len());
        buf[rec_len..rec_len + 8].fill(0);

        assert!(DiskChunkInfo::parse(&buf, MAX_BLOCKS, false).is_ok());
        let err = DiskChunkInfo::parse(&buf, MAX_BLOCKS, true).unwrap_err();
        assert_eq!(err.code(), ChunkCode::BAD_HEADER_CHECKSUM);
    }

    #[test]
    fn test_parse_rejects_oversized_block_count() {
        let info = DiskChunkInfo {
            block_checksums: vec![0; 32],
            ..sample()
        };
        let buf = info.serialize(HEADER_SIZE).unwrap();
        let err = DiskChunkInfo::parse(&buf, 16, false).unwrap_err();
        assert_eq!(err.code(), ChunkCode::MALFORMED_CHUNK_FILE);
    }

    #[test]
    fn test_serialize_rejects_undersized_header() {
        let info = sample();
        let err = info.serialize(32).unwrap_err();
        assert_eq!(err.code(), ChunkCode::INVALID_ARG);
    }

    #[test]
    fn test_validate_identity() {
        let info = sample();
        assert!(info.validate(ChunkId(42), ChunkVersion(3)).is_ok());
        assert!(info.validate(ChunkId(42), ChunkVersion::UNSTABLE).is_ok());
        assert!(info.validate(ChunkId(41), ChunkVersion(3)).is_err());
        assert!(info.validate(ChunkId(42), ChunkVersion(4)).is_err());
    }

    #[test]
    fn test_block_checksum_matches_sparse() {
        let null = 0x1234_5678;
        assert!(block_checksum_matches(7, 7, null, false));
        assert!(block_checksum_matches(0, null, null, true));
        assert!(!block_checksum_matches(0, null, null, false));
        assert!(!block_checksum_matches(1, 2, null, true));
    }

    #[test]
    fn test_reseal_header() {
        let info = sample();
        let mut buf = info.serialize(HEADER_SIZE).unwrap();
        // Bump the stored size, reseal, and confirm it parses again.
        LittleEndian::write_u64(&mut buf[32..40], 4096);
        reseal_header(&mut buf, info.block_checksums.len());
        let parsed = DiskChunkInfo::parse(&buf, MAX_BLOCKS, true).unwrap();
        assert_eq!(parsed.size, 4096);
    }
}
