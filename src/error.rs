//! Error types returned by this crate.

use thiserror::Error;

/// The result type returned by fallible operations in this crate.
pub type McapResult<T> = Result<T, McapError>;

/// Errors that can occur when reading or writing MCAP files.
#[derive(Error, Debug)]
pub enum McapError {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Bad footer record")]
    BadFooter,
    #[error("Not enough data to parse a record")]
    UnexpectedEof,
    #[error("Read a chunk record, but hit EOF before reading all the bytes promised in its header")]
    UnexpectedEoc,
    #[error("Record parse failed")]
    Parse(#[from] binrw::error::Error),
    #[error("Chunk has extra, unread bytes at the end: expected {0} bytes, had more")]
    BadChunkStartOffset(u64),
    #[error("Schema has invalid ID 0")]
    InvalidSchemaId,
    #[error("Message {0}'s channel ID {1} doesn't exist in the MCAP file")]
    UnknownChannel(u32, u16),
    #[error("Channel `{0}`'s schema ID {1} doesn't exist in the MCAP file")]
    UnknownSchema(String, u16),
    #[error("MCAP file has multiple conflicting schemas with name `{0}`")]
    ConflictingSchemas(String),
    #[error("MCAP file has multiple conflicting channels with topic `{0}`")]
    ConflictingChannels(String),
    #[error("Found schema with length {header} longer than the containing record ({available})")]
    BadSchemaLength { header: u32, available: u32 },
    #[error("Found chunk with length {header} longer than the containing record ({available})")]
    BadChunkLength { header: u64, available: u64 },
    #[error(
        "Found attachment with length {header} longer than the containing record ({available})"
    )]
    BadAttachmentLength { header: u64, available: u64 },
    #[error("Attachment CRC failed: saved = {saved:08X}, calculated = {calculated:08X}")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("Chunk CRC failed: saved = {saved:08X}, calculated = {calculated:08X}")]
    BadChunkCrc { saved: u32, calculated: u32 },
    #[error("Data section CRC failed: saved = {saved:08X}, calculated = {calculated:08X}")]
    BadDataCrc { saved: u32, calculated: u32 },
    #[error("Summary section CRC failed: saved = {saved:08X}, calculated = {calculated:08X}")]
    BadSummaryCrc { saved: u32, calculated: u32 },
    #[error("Unsupported compression format `{0}`")]
    UnsupportedCompression(String),
    #[error("Error decompressing chunk: {0}")]
    DecompressionError(String),
    #[error("Record of opcode {opcode:#x} too large to parse: {len} bytes")]
    RecordTooLarge { opcode: u8, len: u64 },
    #[error("Record of opcode {opcode:#x} too short to parse: {len} bytes")]
    RecordTooShort { opcode: u8, len: u64 },
    #[error("Chunk of {0} bytes is too large for this reader to load into memory")]
    ChunkTooLarge(u64),
    #[error("Chunk's buffer of {0} bytes is too large for this writer to buffer in memory")]
    ChunkBufferTooLarge(u64),
    #[error("Length {0} would overflow when converted to file offsets")]
    TooLong(u64),
    #[error("Attempted to register more than {} schemas", u16::MAX)]
    TooManySchemas,
    #[error("Attempted to register more than {} channels", u16::MAX)]
    TooManyChannels,
    #[error("No attachment is currently in progress")]
    AttachmentNotInProgress,
    #[error("Attachment is {excess} bytes larger than the {attachment_length} bytes promised")]
    AttachmentTooLarge { excess: u64, attachment_length: u64 },
    #[error("Attachment is incomplete: wrote {current} of the {expected} bytes promised")]
    AttachmentIncomplete { expected: u64, current: u64 },
    #[error("MCAP file has no summary section to index into")]
    NoIndexAvailable,
    #[error("Index points to data that doesn't parse as expected")]
    BadIndex,
    #[error("File has already been started")]
    AlreadyStarted,
    #[error("File has already been ended")]
    AlreadyEnded,
    #[error("Writer was not opened in append mode")]
    NotInAppendMode,
    #[error("Writer has been poisoned by a previous I/O error and can no longer be used")]
    Poisoned,
    #[error("Record of opcode {0:#x} is not allowed inside a chunk")]
    UnexpectedRecordInChunk(u8),
    #[error("First record in an MCAP file must be a Header")]
    MissingHeader,
    #[error("MCAP file has more than one Header record")]
    DuplicateHeader,
    #[error("{0} bytes remain in the chunk after its last complete record")]
    BytesRemainingInChunk(u64),
    #[error("MessageIndex entry offset {offset} is beyond the chunk's uncompressed length of {chunk_len} bytes")]
    InvalidMessageIndexEntry { offset: u64, chunk_len: u64 },
    #[error(
        "MessageIndex entry has log_time {log_time}, outside the chunk's time bounds [{message_start_time}, {message_end_time}]"
    )]
    MessageIndexOutOfRange {
        log_time: u64,
        message_start_time: u64,
        message_end_time: u64,
    },
    #[error("Chunk at offset {0} has no MessageIndex records and allow_unindexed_chunks is false")]
    UnindexedChunk(u64),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
