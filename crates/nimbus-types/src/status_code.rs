/// Status code type alias; codes are grouped into families by numeric range.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const INVALID_FORMAT: status_code_t = 33;
    pub const IO_ERROR: status_code_t = 69;
    pub const CONFIG_PARSE_ERROR: status_code_t = 71;
    pub const OS_ERROR: status_code_t = 72;
    pub const SHUTTING_DOWN: status_code_t = 73;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Meta-server interaction status codes (3xxx).
pub mod MetaCode {
    use super::status_code_t;

    pub const NOT_CONNECTED: status_code_t = 3000;
    pub const TRY_AGAIN: status_code_t = 3001;
    pub const REQUEST_FAILED: status_code_t = 3002;
    pub const STALE_NOTIFICATION: status_code_t = 3003;
}

/// Chunk engine status codes (4xxx).
pub mod ChunkCode {
    use super::status_code_t;

    pub const NO_SUCH_CHUNK: status_code_t = 4000;
    pub const NO_SUCH_DIR: status_code_t = 4001;
    pub const BAD_CHUNK_VERSION: status_code_t = 4002;
    pub const STABLE_TARGET_MISMATCH: status_code_t = 4003;
    pub const BAD_CHECKSUM: status_code_t = 4004;
    pub const BAD_HEADER_CHECKSUM: status_code_t = 4005;
    pub const SERVER_BUSY: status_code_t = 4006;
    pub const IO_TRY_AGAIN: status_code_t = 4007;
    pub const IO_TIMED_OUT: status_code_t = 4008;
    pub const OUT_OF_MEMORY: status_code_t = 4009;
    pub const IO_ERROR: status_code_t = 4010;
    pub const OPEN_FAILED: status_code_t = 4011;
    pub const NO_SPACE: status_code_t = 4012;
    pub const INVALID_ARG: status_code_t = 4013;
    pub const CHUNK_STABLE: status_code_t = 4014;
    pub const CHUNK_NOT_STABLE: status_code_t = 4015;
    pub const APPEND_MODE_MISMATCH: status_code_t = 4016;
    pub const WRITE_PENDING: status_code_t = 4017;
    pub const NO_SUCH_WRITE_ID: status_code_t = 4018;
    pub const CHUNK_EXISTS: status_code_t = 4019;
    pub const REPLICATION_IN_FLIGHT: status_code_t = 4020;
    pub const STATE_TRANSITION_IN_FLIGHT: status_code_t = 4021;
    pub const CHECKSUMS_NOT_LOADED: status_code_t = 4022;
    pub const MALFORMED_CHUNK_FILE: status_code_t = 4023;

    /// Whether a code belongs to the transient I/O family: the engine
    /// logs these and lets the caller retry instead of evicting the chunk.
    pub fn is_transient(code: status_code_t) -> bool {
        matches!(code, IO_TRY_AGAIN | IO_TIMED_OUT | OUT_OF_MEMORY)
    }
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    Meta = 3,
    Chunk = 4,
}

/// Determine the family of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        3000..=3999 => StatusCodeType::Meta,
        4000..=4999 => StatusCodeType::Chunk,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::CONFIG_PARSE_ERROR => "ConfigParseError",
        StatusCode::OS_ERROR => "OSError",
        StatusCode::SHUTTING_DOWN => "ShuttingDown",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        // Meta
        MetaCode::NOT_CONNECTED => "Meta::NotConnected",
        MetaCode::TRY_AGAIN => "Meta::TryAgain",
        MetaCode::REQUEST_FAILED => "Meta::RequestFailed",
        MetaCode::STALE_NOTIFICATION => "Meta::StaleNotification",

        // Chunk
        ChunkCode::NO_SUCH_CHUNK => "Chunk::NoSuchChunk",
        ChunkCode::NO_SUCH_DIR => "Chunk::NoSuchDir",
        ChunkCode::BAD_CHUNK_VERSION => "Chunk::BadChunkVersion",
        ChunkCode::STABLE_TARGET_MISMATCH => "Chunk::StableTargetMismatch",
        ChunkCode::BAD_CHECKSUM => "Chunk::BadChecksum",
        ChunkCode::BAD_HEADER_CHECKSUM => "Chunk::BadHeaderChecksum",
        ChunkCode::SERVER_BUSY => "Chunk::ServerBusy",
        ChunkCode::IO_TRY_AGAIN => "Chunk::IOTryAgain",
        ChunkCode::IO_TIMED_OUT => "Chunk::IOTimedOut",
        ChunkCode::OUT_OF_MEMORY => "Chunk::OutOfMemory",
        ChunkCode::IO_ERROR => "Chunk::IOError",
        ChunkCode::OPEN_FAILED => "Chunk::OpenFailed",
        ChunkCode::NO_SPACE => "Chunk::NoSpace",
        ChunkCode::INVALID_ARG => "Chunk::InvalidArg",
        ChunkCode::CHUNK_STABLE => "Chunk::ChunkStable",
        ChunkCode::CHUNK_NOT_STABLE => "Chunk::ChunkNotStable",
        ChunkCode::APPEND_MODE_MISMATCH => "Chunk::AppendModeMismatch",
        ChunkCode::WRITE_PENDING => "Chunk::WritePending",
        ChunkCode::NO_SUCH_WRITE_ID => "Chunk::NoSuchWriteId",
        ChunkCode::CHUNK_EXISTS => "Chunk::ChunkExists",
        ChunkCode::REPLICATION_IN_FLIGHT => "Chunk::ReplicationInFlight",
        ChunkCode::STATE_TRANSITION_IN_FLIGHT => "Chunk::StateTransitionInFlight",
        ChunkCode::CHECKSUMS_NOT_LOADED => "Chunk::ChecksumsNotLoaded",
        ChunkCode::MALFORMED_CHUNK_FILE => "Chunk::MalformedChunkFile",

        _ => "UnknownStatusCode",
    }
}

/// Convert a status code to the corresponding POSIX errno value.
pub fn to_errno(code: status_code_t) -> i32 {
    match code {
        c if c == StatusCode::INVALID_ARG || c == ChunkCode::INVALID_ARG => libc::EINVAL,
        c if c == StatusCode::NOT_IMPLEMENTED => libc::ENOSYS,
        c if c == StatusCode::NOT_ENOUGH_MEMORY || c == ChunkCode::OUT_OF_MEMORY => libc::ENOMEM,

        c if c == ChunkCode::NO_SUCH_CHUNK || c == ChunkCode::NO_SUCH_DIR => libc::EBADF,
        c if c == ChunkCode::NO_SPACE => libc::ENOSPC,
        c if c == ChunkCode::IO_TRY_AGAIN => libc::EAGAIN,
        c if c == ChunkCode::IO_TIMED_OUT => libc::ETIMEDOUT,
        c if c == ChunkCode::SERVER_BUSY => libc::EBUSY,

        _ => libc::EIO,
    }
}

/// Map an OS error number from the disk layer to a chunk status code,
/// preserving the transient/fatal split.
pub fn from_errno(errno: i32) -> status_code_t {
    match errno {
        libc::EAGAIN => ChunkCode::IO_TRY_AGAIN,
        libc::ENOMEM => ChunkCode::OUT_OF_MEMORY,
        libc::ETIMEDOUT => ChunkCode::IO_TIMED_OUT,
        libc::ENOSPC => ChunkCode::NO_SPACE,
        libc::EBADF => ChunkCode::NO_SUCH_CHUNK,
        _ => ChunkCode::IO_ERROR,
    }
}
