use binrw::BinRead;

use super::decompressor::Decompressor;
use crate::{
    records::{op, ChunkIndex, MessageHeader},
    McapError, McapResult,
};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    io::SeekFrom,
    ops::Deref,
};

#[cfg(feature = "lz4")]
use super::lz4;

#[cfg(feature = "zstd")]
use super::zstd;

fn new_decompressor(name: &str) -> McapResult<Box<dyn Decompressor>> {
    match name {
        #[cfg(feature = "zstd")]
        "zstd" => Ok(Box::new(zstd::ZstdDecoder::new())),
        #[cfg(feature = "lz4")]
        "lz4" => Ok(Box::new(lz4::Lz4Decoder::new()?)),
        other => Err(McapError::UnsupportedCompression(other.into())),
    }
}

/// Events yielded by the IndexedReader.
pub enum IndexedReadEvent<'a> {
    /// The reader needs more data to provide the next record. Call [`IndexedReader::insert`] then
    /// [`IndexedReader::notify_read`] to load more data. The value provided here is a hint for how
    /// much data to insert.
    ReadRequest(usize),
    /// The reader needs to seek to a different position in the file. Call
    /// [`IndexedReader::notify_seeked`] to inform the reader of the result of the seek.
    SeekRequest(SeekFrom),
    /// Get a new message from the reader.
    Message {
        header: crate::records::MessageHeader,
        data: &'a [u8],
    },
}

/// A chunk's cursor into its own matching messages, keyed by this reader's merge order.
struct ChannelCursor {
    /// `(merge_key, offset_in_uncompressed_chunk)`, sorted ascending by `merge_key`.
    entries: Vec<(u64, u64)>,
    next: usize,
}

impl ChannelCursor {
    fn head_key(&self) -> Option<u64> {
        self.entries.get(self.next).map(|&(key, _)| key)
    }
}

/// The per-chunk state of the heap merge: a chunk starts `Unloaded`, gains a MessageIndex-derived
/// per-channel heap once its index region has been read (`IndexLoaded`), and finally gets its
/// decompressed body once a message inside it is actually due to be yielded (`BodyLoaded`).
enum ChunkCursorState {
    Unloaded,
    IndexLoaded {
        channels: BTreeMap<u16, ChannelCursor>,
        heap: BinaryHeap<Reverse<(u64, u16)>>,
    },
    BodyLoaded {
        slot: usize,
        channels: BTreeMap<u16, ChannelCursor>,
        heap: BinaryHeap<Reverse<(u64, u16)>>,
    },
}

struct ChunkCursor {
    state: ChunkCursorState,
}

/// An entry in the top-level priority queue. Ordered (via the derived `Ord`) by `sort_key` first,
/// then by `loaded` (an unloaded cursor sorts before a loaded one at equal `sort_key`, forcing it
/// to load before being overtaken), then by `chunk_start_offset` to break remaining ties.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct QItem {
    sort_key: u64,
    loaded: bool,
    chunk_start_offset: u64,
    cursor_idx: usize,
}

enum State {
    Dispatch,
    SeekingForMessageIndex {
        cursor_idx: usize,
    },
    LoadingMessageIndex {
        cursor_idx: usize,
    },
    SeekingForChunkCrc {
        cursor_idx: usize,
        needs_scan: bool,
    },
    LoadingChunkCrc {
        cursor_idx: usize,
        needs_scan: bool,
    },
    SeekingForChunkBody {
        cursor_idx: usize,
        needs_scan: bool,
    },
    LoadingChunkBody {
        cursor_idx: usize,
        slot: usize,
        needs_scan: bool,
    },
    Done,
}

struct ChunkSlot {
    buf: Vec<u8>,
    in_use: bool,
}

/// Reads messages from an MCAP file using index information from the summary. This enables
/// efficient filtering by topic, time range, and efficient iteration in log-time order.
///
/// Chunks are visited through a heap merge: each chunk gets a cursor that is `Unloaded`, then
/// `IndexLoaded` once its MessageIndex region has been read (giving a per-channel heap of
/// candidate messages), then `BodyLoaded` once a message inside it is actually about to be
/// yielded. A top-level priority queue orders these cursors by their next candidate's merge key,
/// so only the chunks actually needed to produce the next message in order are ever decompressed.
///
/// This struct does not perform any I/O on its own, instead it requests reads and seeks from the
/// caller and allows them to use their own I/O primitives.
/// ```no_run
/// use std::fs;
///
/// use std::io::{Read, Seek};
///
/// use logcap::sans_io::summary_reader::SummaryReadEvent;
/// use logcap::sans_io::indexed_reader::IndexedReadEvent;
/// use logcap::McapResult;
///
/// fn read_sync() -> McapResult<()> {
///     let mut file = fs::File::open("in.mcap")?;
///     let summary = {
///         let mut reader = logcap::sans_io::summary_reader::SummaryReader::new();
///         while let Some(event) = reader.next_event() {
///             match event? {
///                 SummaryReadEvent::ReadRequest(need) => {
///                     let written = file.read(reader.insert(need))?;
///                     reader.notify_read(written);
///                 },
///                 SummaryReadEvent::SeekRequest(to) => {
///                     reader.notify_seeked(file.seek(to)?);
///                 }
///             }
///         }
///         reader.finish().unwrap()
///     };
///     let mut reader = logcap::sans_io::indexed_reader::IndexedReader::new(&summary).expect("could not construct reader");
///     while let Some(event) = reader.next_event() {
///         match event? {
///             IndexedReadEvent::ReadRequest(need) => {
///                 let written = file.read(reader.insert(need))?;
///                 reader.notify_read(written);
///             },
///             IndexedReadEvent::SeekRequest(to) => {
///                 reader.notify_seeked(file.seek(to)?);
///             },
///             IndexedReadEvent::Message{ header, data } => {
///                 let channel = summary.channels.get(&header.channel_id).unwrap();
///                 // do something with the message header and data
///             }
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct IndexedReader {
    // This MCAP's chunk indexes, pre-filtered by time range and topic. `cursors` has exactly one
    // entry per element here, at the same index.
    chunk_indexes: Vec<ChunkIndex>,
    cursors: Vec<ChunkCursor>,
    // The top-level priority queue of chunk cursors awaiting their next step (index load, body
    // load, or yield).
    queue: BinaryHeap<Reverse<QItem>>,
    // Decompressed chunk bodies, indexed by slot. Slots are reused once a chunk's heap drains.
    chunk_slots: Vec<ChunkSlot>,
    // Buffer for a chunk's MessageIndex region while it's being read in.
    cur_message_index_buf: Vec<u8>,
    cur_message_index_loaded: usize,
    // Buffer for a chunk's declared uncompressed CRC (read from the Chunk record's fixed header),
    // when `validate_chunk_crcs` is set.
    cur_crc_buf: Vec<u8>,
    cur_crc_loaded: usize,
    pending_chunk_crc: u32,
    // Buffer for a chunk's compressed (or, for uncompressed chunks, raw) body while loading.
    cur_compressed_chunk: Vec<u8>,
    cur_compressed_chunk_loaded_bytes: usize,
    // The current known position of the reader in the underlying file.
    pos: u64,
    state: State,
    order: ReadOrder,
    filter: Filter,
    allow_unindexed_chunks: bool,
    validate_chunk_crcs: bool,
    at_eof: bool,
}

struct Filter {
    // inclusive log time range start
    start: Option<u64>,
    // exclusive log time range end
    end: Option<u64>,
    // If non-empty, only channels with these IDs will be yielded
    channel_ids: BTreeSet<u16>,
}

#[derive(Debug, Default, Clone, Copy)]
pub enum ReadOrder {
    /// Yield messages in order of message.log_time. For messages with equal log times, the message
    /// earlier in the underlying file will be yielded first.
    #[default]
    LogTime,
    /// Yield messages in reverse message.log_time order. For messages with equal log times, the
    /// message later in the underlying file will be yielded first.
    ReverseLogTime,
    /// Yield messages in the order they are present in the file.
    File,
}

#[derive(Clone)]
pub struct IndexedReaderOptions {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub order: ReadOrder,
    pub include_topics: Option<BTreeSet<String>>,
    /// If false, a chunk with no MessageIndex records fails the read with
    /// [`McapError::UnindexedChunk`] instead of being scanned sequentially.
    pub allow_unindexed_chunks: bool,
    /// Enables CRC validation of a chunk's uncompressed body when it's loaded. A chunk with a
    /// declared CRC of 0 is never validated, regardless of this setting.
    pub validate_chunk_crcs: bool,
}

impl Default for IndexedReaderOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            order: ReadOrder::default(),
            include_topics: None,
            allow_unindexed_chunks: true,
            validate_chunk_crcs: false,
        }
    }
}

impl IndexedReaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the reader to yield messages in the specified order (defaults to log-time order).
    pub fn with_order(mut self, order: ReadOrder) -> Self {
        self.order = order;
        self
    }

    /// Configure the reader to yield only messages from topics matching this set of strings.
    /// By default, all topics will be yielded.
    pub fn include_topics<T: IntoIterator<Item = impl Deref<Target = str>>>(
        mut self,
        topics: T,
    ) -> Self {
        self.include_topics = Some(topics.into_iter().map(|p| p.to_owned()).collect());
        self
    }

    /// Configure the reader to yield only messages with log time on or after this time.
    pub fn log_time_on_or_after(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    /// Configure the reader to yield only messages with log time before this time.
    pub fn log_time_before(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Configure whether chunks without MessageIndex records are read via a sequential scan
    /// (`true`, the default) or rejected with [`McapError::UnindexedChunk`] (`false`).
    pub fn with_allow_unindexed_chunks(mut self, allow_unindexed_chunks: bool) -> Self {
        self.allow_unindexed_chunks = allow_unindexed_chunks;
        self
    }

    /// Configure whether a chunk's declared uncompressed CRC is checked against its actual
    /// decompressed content when the chunk is loaded.
    pub fn with_validate_chunk_crcs(mut self, validate_chunk_crcs: bool) -> Self {
        self.validate_chunk_crcs = validate_chunk_crcs;
        self
    }
}

/// The value a chunk cursor (or the per-channel cursor inside it) sorts by at the top level,
/// while unloaded: the chunk's own declared time bound (or file offset, for file order).
fn initial_sort_key(order: ReadOrder, chunk_index: &ChunkIndex) -> u64 {
    match order {
        ReadOrder::File => chunk_index.chunk_start_offset,
        ReadOrder::LogTime => chunk_index.message_start_time,
        ReadOrder::ReverseLogTime => u64::MAX - chunk_index.message_end_time,
    }
}

/// The value a loaded chunk cursor sorts by at the top level. In file order, chunks never
/// interleave (they occupy disjoint byte ranges), so the chunk's own offset is used throughout
/// rather than an in-chunk offset, which would only be comparable within that one chunk.
fn loaded_sort_key(order: ReadOrder, chunk_index: &ChunkIndex, head_merge_key: u64) -> u64 {
    match order {
        ReadOrder::File => chunk_index.chunk_start_offset,
        ReadOrder::LogTime | ReadOrder::ReverseLogTime => head_merge_key,
    }
}

/// The value a single message sorts by within its chunk.
fn merge_key(order: ReadOrder, log_time: u64, offset: u64) -> u64 {
    match order {
        ReadOrder::File => offset,
        ReadOrder::LogTime => log_time,
        ReadOrder::ReverseLogTime => u64::MAX - log_time,
    }
}

/// The file offset of the 4-byte `uncompressed_crc` field inside a Chunk record.
fn chunk_crc_offset(chunk_start_offset: u64) -> u64 {
    chunk_start_offset
        + 1 // opcode
        + 8 // chunk record length
        + 8 // start time
        + 8 // end time
        + 8 // uncompressed size
}

impl IndexedReader {
    pub fn new(summary: &crate::Summary) -> McapResult<Self> {
        Self::new_with_options(summary, IndexedReaderOptions::default())
    }

    pub fn new_with_options(
        summary: &crate::Summary,
        options: IndexedReaderOptions,
    ) -> McapResult<Self> {
        let channel_ids = if let Some(include_topics) = options.include_topics {
            let mut set = BTreeSet::new();
            for (id, channel) in summary.channels.iter() {
                if include_topics.contains(&channel.topic) {
                    set.insert(*id);
                }
            }
            set
        } else {
            BTreeSet::new()
        };

        // filter out chunks that we won't use
        let mut chunk_indexes: Vec<crate::records::ChunkIndex> = summary
            .chunk_indexes
            .clone()
            .into_iter()
            .filter(|chunk_index| {
                if let Some(start) = options.start {
                    if chunk_index.message_end_time < start {
                        return false;
                    }
                }
                if let Some(end) = options.end {
                    if chunk_index.message_start_time >= end {
                        return false;
                    }
                }
                if channel_ids.is_empty() {
                    return true;
                }
                // NOTE: if there are no message indexes, we can't reject this chunk because
                // the file may not have message indexes included.
                if chunk_index.message_index_offsets.is_empty() {
                    return true;
                }
                for key in chunk_index.message_index_offsets.keys() {
                    if channel_ids.contains(key) {
                        return true;
                    }
                }
                false
            })
            .collect();

        // put the chunk indexes in a stable order; the actual merge order is driven by the queue
        chunk_indexes.sort_by(|a, b| a.chunk_start_offset.cmp(&b.chunk_start_offset));

        // check through all chunk indexes once to ensure that we have address space for an
        // uncompressed chunk.
        for chunk_index in chunk_indexes.iter() {
            if chunk_index.compressed_size > usize::MAX as u64 {
                return Err(McapError::TooLong(chunk_index.compressed_size));
            }
            if chunk_index.uncompressed_size > usize::MAX as u64 {
                return Err(McapError::TooLong(chunk_index.uncompressed_size));
            }
        }

        let mut cursors = Vec::with_capacity(chunk_indexes.len());
        let mut queue = BinaryHeap::with_capacity(chunk_indexes.len());
        for (cursor_idx, chunk_index) in chunk_indexes.iter().enumerate() {
            queue.push(Reverse(QItem {
                sort_key: initial_sort_key(options.order, chunk_index),
                loaded: false,
                chunk_start_offset: chunk_index.chunk_start_offset,
                cursor_idx,
            }));
            cursors.push(ChunkCursor {
                state: ChunkCursorState::Unloaded,
            });
        }

        Ok(Self {
            chunk_indexes,
            cursors,
            queue,
            chunk_slots: Vec::new(),
            cur_message_index_buf: Vec::new(),
            cur_message_index_loaded: 0,
            cur_crc_buf: Vec::new(),
            cur_crc_loaded: 0,
            pending_chunk_crc: 0,
            cur_compressed_chunk: Vec::new(),
            cur_compressed_chunk_loaded_bytes: 0,
            pos: 0,
            state: State::Dispatch,
            order: options.order,
            filter: Filter {
                start: options.start,
                end: options.end,
                channel_ids,
            },
            allow_unindexed_chunks: options.allow_unindexed_chunks,
            validate_chunk_crcs: options.validate_chunk_crcs,
            at_eof: false,
        })
    }

    /// Returns the next event from the reader. Call this repeatedly and act on the resulting
    /// events in order to read messages from the MCAP.
    pub fn next_event(&mut self) -> Option<McapResult<IndexedReadEvent<'_>>> {
        self.next_event_inner().transpose()
    }

    fn next_event_inner(&mut self) -> McapResult<Option<IndexedReadEvent<'_>>> {
        loop {
            match self.state {
                State::Dispatch => {
                    let Some(Reverse(item)) = self.queue.pop() else {
                        self.state = State::Done;
                        return Ok(None);
                    };
                    let cursor_idx = item.cursor_idx;
                    let state = std::mem::replace(
                        &mut self.cursors[cursor_idx].state,
                        ChunkCursorState::Unloaded,
                    );
                    match state {
                        ChunkCursorState::Unloaded => {
                            let chunk_index = &self.chunk_indexes[cursor_idx];
                            if chunk_index.message_index_offsets.is_empty() {
                                if !self.allow_unindexed_chunks {
                                    return Err(McapError::UnindexedChunk(
                                        chunk_index.chunk_start_offset,
                                    ));
                                }
                                self.cur_compressed_chunk.clear();
                                self.cur_compressed_chunk_loaded_bytes = 0;
                                self.cur_crc_loaded = 0;
                                self.state = if self.validate_chunk_crcs {
                                    State::SeekingForChunkCrc {
                                        cursor_idx,
                                        needs_scan: true,
                                    }
                                } else {
                                    State::SeekingForChunkBody {
                                        cursor_idx,
                                        needs_scan: true,
                                    }
                                };
                            } else {
                                self.cur_message_index_buf.clear();
                                self.cur_message_index_loaded = 0;
                                self.state = State::SeekingForMessageIndex { cursor_idx };
                            }
                        }
                        ChunkCursorState::IndexLoaded { channels, heap } => {
                            if heap.is_empty() {
                                // nothing in this chunk matched the filter; drop it entirely
                                continue;
                            }
                            self.cursors[cursor_idx].state =
                                ChunkCursorState::IndexLoaded { channels, heap };
                            self.cur_compressed_chunk.clear();
                            self.cur_compressed_chunk_loaded_bytes = 0;
                            self.cur_crc_loaded = 0;
                            self.state = if self.validate_chunk_crcs {
                                State::SeekingForChunkCrc {
                                    cursor_idx,
                                    needs_scan: false,
                                }
                            } else {
                                State::SeekingForChunkBody {
                                    cursor_idx,
                                    needs_scan: false,
                                }
                            };
                        }
                        ChunkCursorState::BodyLoaded {
                            slot,
                            mut channels,
                            mut heap,
                        } => {
                            let Some(Reverse((_, channel_id))) = heap.pop() else {
                                self.chunk_slots[slot].in_use = false;
                                continue;
                            };
                            let offset = {
                                let channel = channels
                                    .get_mut(&channel_id)
                                    .expect("heap entry without a channel cursor");
                                let (_, offset) = channel.entries[channel.next];
                                channel.next += 1;
                                if let Some(next_key) = channel.head_key() {
                                    heap.push(Reverse((next_key, channel_id)));
                                }
                                offset
                            };
                            if heap.is_empty() {
                                self.chunk_slots[slot].in_use = false;
                            } else {
                                let top_key = heap.peek().unwrap().0 .0;
                                let chunk_start_offset =
                                    self.chunk_indexes[cursor_idx].chunk_start_offset;
                                let sort_key = loaded_sort_key(
                                    self.order,
                                    &self.chunk_indexes[cursor_idx],
                                    top_key,
                                );
                                self.queue.push(Reverse(QItem {
                                    sort_key,
                                    loaded: true,
                                    chunk_start_offset,
                                    cursor_idx,
                                }));
                            }
                            self.cursors[cursor_idx].state = ChunkCursorState::BodyLoaded {
                                slot,
                                channels,
                                heap,
                            };
                            let chunk_len = self.chunk_slots[slot].buf.len() as u64;
                            if offset >= chunk_len {
                                return Err(McapError::InvalidMessageIndexEntry {
                                    offset,
                                    chunk_len,
                                });
                            }
                            let record = &self.chunk_slots[slot].buf[offset as usize..];
                            if record.len() < 9 || record[0] != op::MESSAGE {
                                return Err(McapError::InvalidMessageIndexEntry {
                                    offset,
                                    chunk_len,
                                });
                            }
                            let len = u64::from_le_bytes(record[1..9].try_into().unwrap());
                            let len = len_as_usize(len)?;
                            if 9 + len > record.len() {
                                return Err(McapError::InvalidMessageIndexEntry {
                                    offset,
                                    chunk_len,
                                });
                            }
                            let mut cursor = std::io::Cursor::new(&record[9..9 + len]);
                            let header = MessageHeader::read_le(&mut cursor)?;
                            let header_end = cursor.position() as usize;
                            let msg_buf = cursor.into_inner();
                            let data = &msg_buf[header_end..];
                            return Ok(Some(IndexedReadEvent::Message { header, data }));
                        }
                    }
                }
                State::SeekingForMessageIndex { cursor_idx } => {
                    let region_start = *self.chunk_indexes[cursor_idx]
                        .message_index_offsets
                        .values()
                        .min()
                        .expect("checked non-empty above");
                    if self.pos != region_start {
                        return Ok(Some(IndexedReadEvent::SeekRequest(SeekFrom::Start(
                            region_start,
                        ))));
                    }
                    self.state = State::LoadingMessageIndex { cursor_idx };
                }
                State::LoadingMessageIndex { cursor_idx } => {
                    let region_len =
                        len_as_usize(self.chunk_indexes[cursor_idx].message_index_length)?;
                    if self.cur_message_index_loaded < region_len {
                        if self.at_eof {
                            return Err(McapError::UnexpectedEof);
                        }
                        return Ok(Some(IndexedReadEvent::ReadRequest(
                            region_len - self.cur_message_index_loaded,
                        )));
                    }
                    let (channels, heap) = self.build_index_from_message_index_region(cursor_idx)?;
                    if heap.is_empty() {
                        self.state = State::Dispatch;
                        continue;
                    }
                    let top_key = heap.peek().unwrap().0 .0;
                    let chunk_start_offset = self.chunk_indexes[cursor_idx].chunk_start_offset;
                    let sort_key =
                        loaded_sort_key(self.order, &self.chunk_indexes[cursor_idx], top_key);
                    self.queue.push(Reverse(QItem {
                        sort_key,
                        loaded: true,
                        chunk_start_offset,
                        cursor_idx,
                    }));
                    self.cursors[cursor_idx].state = ChunkCursorState::IndexLoaded { channels, heap };
                    self.state = State::Dispatch;
                }
                State::SeekingForChunkCrc {
                    cursor_idx,
                    needs_scan,
                } => {
                    let target = chunk_crc_offset(self.chunk_indexes[cursor_idx].chunk_start_offset);
                    if self.pos != target {
                        return Ok(Some(IndexedReadEvent::SeekRequest(SeekFrom::Start(target))));
                    }
                    self.state = State::LoadingChunkCrc {
                        cursor_idx,
                        needs_scan,
                    };
                }
                State::LoadingChunkCrc {
                    cursor_idx,
                    needs_scan,
                } => {
                    if self.cur_crc_loaded < 4 {
                        if self.at_eof {
                            return Err(McapError::UnexpectedEof);
                        }
                        return Ok(Some(IndexedReadEvent::ReadRequest(4 - self.cur_crc_loaded)));
                    }
                    self.pending_chunk_crc =
                        u32::from_le_bytes(self.cur_crc_buf[..4].try_into().unwrap());
                    self.state = State::SeekingForChunkBody {
                        cursor_idx,
                        needs_scan,
                    };
                }
                State::SeekingForChunkBody {
                    cursor_idx,
                    needs_scan,
                } => {
                    let target = self.chunk_indexes[cursor_idx].compressed_data_offset()?;
                    if self.pos != target {
                        return Ok(Some(IndexedReadEvent::SeekRequest(SeekFrom::Start(target))));
                    }
                    let uncompressed_size =
                        len_as_usize(self.chunk_indexes[cursor_idx].uncompressed_size)?;
                    let slot = find_or_make_chunk_slot(&mut self.chunk_slots, uncompressed_size);
                    self.state = State::LoadingChunkBody {
                        cursor_idx,
                        slot,
                        needs_scan,
                    };
                }
                State::LoadingChunkBody {
                    cursor_idx,
                    slot,
                    needs_scan,
                } => {
                    let compressed_size =
                        len_as_usize(self.chunk_indexes[cursor_idx].compressed_size)?;
                    let uncompressed_size =
                        len_as_usize(self.chunk_indexes[cursor_idx].uncompressed_size)?;
                    if self.cur_compressed_chunk_loaded_bytes < compressed_size {
                        let need = compressed_size - self.cur_compressed_chunk_loaded_bytes;
                        if self.at_eof {
                            return Err(McapError::UnexpectedEof);
                        }
                        return Ok(Some(IndexedReadEvent::ReadRequest(need)));
                    }
                    let compression = self.chunk_indexes[cursor_idx].compression.clone();
                    {
                        let slot_ref = &mut self.chunk_slots[slot];
                        slot_ref.buf.resize(uncompressed_size, 0);
                        slot_ref.in_use = true;
                        match compression.as_str() {
                            "" => {
                                slot_ref.buf[..compressed_size]
                                    .copy_from_slice(&self.cur_compressed_chunk[..compressed_size]);
                            }
                            name => {
                                let mut decompressor = new_decompressor(name)?;
                                let mut src = &self.cur_compressed_chunk[..compressed_size];
                                let mut dst = &mut slot_ref.buf[..];
                                while !dst.is_empty() {
                                    let res = decompressor.decompress(src, dst)?;
                                    if res.consumed == 0 && res.wrote == 0 {
                                        return Err(McapError::DecompressionError(
                                            "decompressor made no progress before the chunk's \
                                             declared uncompressed size was reached"
                                                .into(),
                                        ));
                                    }
                                    src = &src[res.consumed..];
                                    dst = &mut dst[res.wrote..];
                                }
                            }
                        }
                    }
                    if self.validate_chunk_crcs && self.pending_chunk_crc != 0 {
                        let calculated = crc32fast::hash(&self.chunk_slots[slot].buf);
                        if calculated != self.pending_chunk_crc {
                            return Err(McapError::BadChunkCrc {
                                saved: self.pending_chunk_crc,
                                calculated,
                            });
                        }
                    }
                    let (channels, heap) = if needs_scan {
                        self.scan_chunk_body_for_index(slot)?
                    } else {
                        match std::mem::replace(
                            &mut self.cursors[cursor_idx].state,
                            ChunkCursorState::Unloaded,
                        ) {
                            ChunkCursorState::IndexLoaded { channels, heap } => (channels, heap),
                            _ => unreachable!("chunk body load requires an index-loaded cursor"),
                        }
                    };
                    if heap.is_empty() {
                        self.chunk_slots[slot].in_use = false;
                        self.state = State::Dispatch;
                        continue;
                    }
                    let top_key = heap.peek().unwrap().0 .0;
                    let chunk_start_offset = self.chunk_indexes[cursor_idx].chunk_start_offset;
                    let sort_key =
                        loaded_sort_key(self.order, &self.chunk_indexes[cursor_idx], top_key);
                    self.queue.push(Reverse(QItem {
                        sort_key,
                        loaded: true,
                        chunk_start_offset,
                        cursor_idx,
                    }));
                    self.cursors[cursor_idx].state = ChunkCursorState::BodyLoaded {
                        slot,
                        channels,
                        heap,
                    };
                    self.state = State::Dispatch;
                }
                State::Done => {
                    return Ok(None);
                }
            }
        }
    }

    /// Parses every MessageIndex record in `self.cur_message_index_buf` (the just-read index
    /// region for `cursor_idx`'s chunk), validating each entry against the chunk's own declared
    /// bounds and filtering to this reader's requested time range and channels.
    fn build_index_from_message_index_region(
        &self,
        cursor_idx: usize,
    ) -> McapResult<(BTreeMap<u16, ChannelCursor>, BinaryHeap<Reverse<(u64, u16)>>)> {
        let chunk_index = &self.chunk_indexes[cursor_idx];
        let buf = &self.cur_message_index_buf[..];
        let mut channels = BTreeMap::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            if buf.len() - offset < 9 {
                return Err(McapError::BadIndex);
            }
            let opcode = buf[offset];
            let len = len_as_usize(u64::from_le_bytes(
                buf[offset + 1..offset + 9].try_into().unwrap(),
            ))?;
            let body_start = offset + 9;
            let body_end = body_start + len;
            if body_end > buf.len() {
                return Err(McapError::BadIndex);
            }
            if opcode != op::MESSAGE_INDEX {
                return Err(McapError::BadIndex);
            }
            let mi = crate::records::MessageIndex::read_le(&mut std::io::Cursor::new(
                &buf[body_start..body_end],
            ))?;
            offset = body_end;
            if !self.filter.channel_ids.is_empty()
                && !self.filter.channel_ids.contains(&mi.channel_id)
            {
                continue;
            }
            let mut entries = Vec::with_capacity(mi.records.len());
            for entry in &mi.records {
                if entry.offset >= chunk_index.uncompressed_size {
                    return Err(McapError::InvalidMessageIndexEntry {
                        offset: entry.offset,
                        chunk_len: chunk_index.uncompressed_size,
                    });
                }
                if entry.log_time < chunk_index.message_start_time
                    || entry.log_time > chunk_index.message_end_time
                {
                    return Err(McapError::MessageIndexOutOfRange {
                        log_time: entry.log_time,
                        message_start_time: chunk_index.message_start_time,
                        message_end_time: chunk_index.message_end_time,
                    });
                }
                if let Some(end) = self.filter.end {
                    if entry.log_time >= end {
                        continue;
                    }
                }
                if let Some(start) = self.filter.start {
                    if entry.log_time < start {
                        continue;
                    }
                }
                entries.push((
                    merge_key(self.order, entry.log_time, entry.offset),
                    entry.offset,
                ));
            }
            if entries.is_empty() {
                continue;
            }
            entries.sort_by_key(|&(key, _)| key);
            channels.insert(mi.channel_id, ChannelCursor { entries, next: 0 });
        }
        let mut heap = BinaryHeap::new();
        for (&channel_id, cursor) in channels.iter() {
            if let Some(key) = cursor.head_key() {
                heap.push(Reverse((key, channel_id)));
            }
        }
        Ok((channels, heap))
    }

    /// Builds a per-channel index for a chunk with no MessageIndex records, by linearly scanning
    /// its decompressed body. Used for the `allow_unindexed_chunks` fallback path.
    fn scan_chunk_body_for_index(
        &self,
        slot: usize,
    ) -> McapResult<(BTreeMap<u16, ChannelCursor>, BinaryHeap<Reverse<(u64, u16)>>)> {
        let buf = &self.chunk_slots[slot].buf;
        let mut per_channel: BTreeMap<u16, Vec<(u64, u64)>> = BTreeMap::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            if buf.len() - offset < 9 {
                return Err(McapError::UnexpectedEoc);
            }
            let opcode = buf[offset];
            let len = len_as_usize(u64::from_le_bytes(
                buf[offset + 1..offset + 9].try_into().unwrap(),
            ))?;
            let body_start = offset + 9;
            let next_offset = body_start + len;
            if next_offset > buf.len() {
                return Err(McapError::UnexpectedEoc);
            }
            if opcode != op::MESSAGE {
                offset = next_offset;
                continue;
            }
            let header =
                MessageHeader::read_le(&mut std::io::Cursor::new(&buf[body_start..next_offset]))?;
            if let Some(end) = self.filter.end {
                if header.log_time >= end {
                    offset = next_offset;
                    continue;
                }
            }
            if let Some(start) = self.filter.start {
                if header.log_time < start {
                    offset = next_offset;
                    continue;
                }
            }
            if !self.filter.channel_ids.is_empty()
                && !self.filter.channel_ids.contains(&header.channel_id)
            {
                offset = next_offset;
                continue;
            }
            let key = merge_key(self.order, header.log_time, offset as u64);
            per_channel
                .entry(header.channel_id)
                .or_default()
                .push((key, offset as u64));
            offset = next_offset;
        }
        let mut channels = BTreeMap::new();
        let mut heap = BinaryHeap::new();
        for (channel_id, mut entries) in per_channel {
            entries.sort_by_key(|&(key, _)| key);
            if let Some(&(key, _)) = entries.first() {
                heap.push(Reverse((key, channel_id)));
            }
            channels.insert(channel_id, ChannelCursor { entries, next: 0 });
        }
        Ok((channels, heap))
    }

    /// Inform the reader of the result of the latest read on the underlying stream. 0 implies
    /// that the end of stream has been reached.
    ///
    /// Panics if `n` is greater than the last `n` provided to [`Self::insert`].
    pub fn notify_read(&mut self, n: usize) {
        self.at_eof = n == 0;
        match self.state {
            State::LoadingMessageIndex { .. } => self.cur_message_index_loaded += n,
            State::LoadingChunkCrc { .. } => self.cur_crc_loaded += n,
            State::LoadingChunkBody { .. } => self.cur_compressed_chunk_loaded_bytes += n,
            _ => {}
        }
        self.pos += n as u64;
    }

    /// Inform the reader of the result of the latest seek of the underlying stream.
    pub fn notify_seeked(&mut self, pos: u64) {
        if self.at_eof && self.pos != pos {
            self.at_eof = false;
        }
        if self.pos != pos {
            match self.state {
                State::LoadingMessageIndex { cursor_idx } => {
                    self.cur_message_index_loaded = 0;
                    self.state = State::SeekingForMessageIndex { cursor_idx };
                }
                State::LoadingChunkCrc {
                    cursor_idx,
                    needs_scan,
                } => {
                    self.cur_crc_loaded = 0;
                    self.state = State::SeekingForChunkCrc {
                        cursor_idx,
                        needs_scan,
                    };
                }
                State::LoadingChunkBody {
                    cursor_idx,
                    needs_scan,
                    ..
                } => {
                    self.cur_compressed_chunk_loaded_bytes = 0;
                    self.state = State::SeekingForChunkBody {
                        cursor_idx,
                        needs_scan,
                    };
                }
                _ => {}
            }
        }
        self.pos = pos;
    }

    /// Get a mutable buffer of size `n` to read new MCAP data into from the stream.
    pub fn insert(&mut self, n: usize) -> &mut [u8] {
        match self.state {
            State::LoadingMessageIndex { .. } => {
                let start = self.cur_message_index_loaded;
                let end = start + n;
                self.cur_message_index_buf.resize(end, 0);
                &mut self.cur_message_index_buf[start..end]
            }
            State::LoadingChunkCrc { .. } => {
                let start = self.cur_crc_loaded;
                let end = start + n;
                self.cur_crc_buf.resize(end, 0);
                &mut self.cur_crc_buf[start..end]
            }
            State::LoadingChunkBody { .. } => {
                let start = self.cur_compressed_chunk_loaded_bytes;
                let end = start + n;
                self.cur_compressed_chunk.resize(end, 0);
                &mut self.cur_compressed_chunk[start..end]
            }
            _ => {
                self.cur_compressed_chunk.resize(n, 0);
                &mut self.cur_compressed_chunk[..n]
            }
        }
    }
}

/// Finds a chunk slot with no outstanding messages in it and returns its index, or creates a new one.
fn find_or_make_chunk_slot(chunk_slots: &mut Vec<ChunkSlot>, uncompressed_size: usize) -> usize {
    for (i, slot) in chunk_slots.iter_mut().enumerate() {
        if !slot.in_use {
            slot.buf.clear();
            slot.buf.reserve(uncompressed_size);
            return i;
        }
    }
    let idx = chunk_slots.len();
    chunk_slots.push(ChunkSlot {
        in_use: false,
        buf: Vec::with_capacity(uncompressed_size),
    });
    idx
}

fn len_as_usize(len: u64) -> McapResult<usize> {
    len.try_into().map_err(|_| McapError::TooLong(len))
}
