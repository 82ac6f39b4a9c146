#![doc = include_str!("../README.md")]

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

mod error;

pub mod channels;
pub mod io_utils;
pub mod read;
pub mod records;
pub mod sans_io;
pub mod write;

pub use error::{McapError, McapResult};
pub use read::{ChunkFlattener, ChunkReader, LinearReader, MessageStream, RawMessageStream, Summary};
pub use write::{WriteOptions, Writer};

/// The leading (and trailing) magic bytes of an MCAP file.
pub const MAGIC: &[u8] = &[0x89, b'M', b'C', b'A', b'P', 0x30, b'\r', b'\n'];

/// A compression algorithm used on [`Chunk`](records::ChunkHeader) bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "lz4")]
    Lz4,
}

impl Compression {
    pub(crate) fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
            #[cfg(feature = "lz4")]
            Compression::Lz4 => "lz4",
        }
    }
}

/// A schema, identifying how the messages on one or more [`Channel`]s are serialized.
///
/// `id` is assigned by whoever wrote the file - the writer in this crate assigns it on
/// first registration; a reader takes whatever ID was present on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schema<'a> {
    pub id: u16,
    pub name: String,
    pub encoding: String,
    pub data: Cow<'a, [u8]>,
}

/// A stream of messages with a common topic, serialization, and (optionally) [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel<'a> {
    pub id: u16,
    pub topic: String,
    pub schema: Option<Arc<Schema<'a>>>,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// A message on a [`Channel`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message<'a> {
    pub channel: Arc<Channel<'a>>,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Cow<'a, [u8]>,
}

/// An attachment: arbitrary named, timestamped bytes alongside the message stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment<'a> {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'a, [u8]>,
}
