//! Write MCAP files

use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::{self, prelude::*, Cursor},
    mem::size_of,
};

use bimap::BiHashMap;
use binrw::prelude::*;
use byteorder::{WriteBytesExt, LE};

use crate::{
    io_utils::{CountingCrcWriter, CountingWriter},
    records::{self, op, AttachmentHeader, AttachmentIndex, MessageHeader, Record},
    Attachment, Compression, McapError, McapResult, Message, Schema, MAGIC,
};

pub use records::Metadata;

/// The destination a [`Writer`] appends bytes to.
///
/// This trait has no seek capability: every byte the writer produces is appended in file order,
/// so record lengths are computed by buffering a record's body before its length prefix is
/// written. [`io_utils::CountingWriter`] is the canonical implementation, turning any [`Write`]
/// into one that can also report its position.
pub trait Sink: Write {
    /// The number of bytes written to this sink so far.
    fn position(&self) -> u64;
}

impl<W: Write> Sink for CountingWriter<W> {
    fn position(&self) -> u64 {
        CountingWriter::position(self)
    }
}

fn op_and_len<W: Write>(w: &mut W, op: u8, len: u64) -> io::Result<()> {
    w.write_u8(op)?;
    w.write_u64::<LE>(len)?;
    Ok(())
}

fn write_record<W: Write>(w: &mut W, r: &Record) -> io::Result<()> {
    // We buffer the body first since the length prefix needs to be known before we write it,
    // and our sink can't seek back to fix it up afterwards.
    macro_rules! record {
        ($op:expr, $b:ident) => {{
            let mut rec_buf = Vec::new();
            Cursor::new(&mut rec_buf).write_le($b).unwrap();

            op_and_len(w, $op, rec_buf.len() as _)?;
            w.write_all(&rec_buf)?;
        }};
    }

    match r {
        Record::Header(h) => record!(op::HEADER, h),
        Record::Footer(_) => {
            unreachable!("Footer handles its own serialization because its CRC is self-referencing")
        }
        Record::Schema { header, data } => {
            let mut header_buf = Vec::new();
            Cursor::new(&mut header_buf).write_le(header).unwrap();

            op_and_len(
                w,
                op::SCHEMA,
                (header_buf.len() + size_of::<u32>() + data.len()) as _,
            )?;
            w.write_all(&header_buf)?;
            w.write_u32::<LE>(data.len() as u32)?;
            w.write_all(data)?;
        }
        Record::Channel(c) => record!(op::CHANNEL, c),
        Record::Message { header, data } => {
            let mut header_buf = Vec::new();
            Cursor::new(&mut header_buf).write_le(header).unwrap();

            op_and_len(w, op::MESSAGE, (header_buf.len() + data.len()) as _)?;
            w.write_all(&header_buf)?;
            w.write_all(data)?;
        }
        Record::Chunk { .. } => {
            unreachable!("Chunks handle their own serialization to build the header up front")
        }
        Record::MessageIndex(_) => {
            unreachable!("MessageIndexes handle their own serialization to recycle the buffer between indexes")
        }
        Record::ChunkIndex(c) => record!(op::CHUNK_INDEX, c),
        Record::Attachment { .. } => {
            unreachable!("Attachments handle their own serialization to handle large files")
        }
        Record::AttachmentIndex(ai) => record!(op::ATTACHMENT_INDEX, ai),
        Record::Statistics(s) => record!(op::STATISTICS, s),
        Record::Metadata(m) => record!(op::METADATA, m),
        Record::MetadataIndex(mi) => record!(op::METADATA_INDEX, mi),
        Record::SummaryOffset(so) => record!(op::SUMMARY_OFFSET, so),
        Record::DataEnd(eod) => record!(op::DATA_END, eod),
        Record::Unknown { .. } => {
            unreachable!("the writer never produces unknown records")
        }
    };
    Ok(())
}

/// Configuration for a [`Writer`].
///
/// Every flag defaults to "on" for the indexing/statistics fields, matching what most readers
/// expect; turning them off trades smaller/faster writes for a less navigable file.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    compression: Option<Compression>,
    profile: String,
    chunk_size: Option<u64>,
    use_chunks: bool,
    use_message_index: bool,
    use_chunk_index: bool,
    use_statistics: bool,
    use_attachment_index: bool,
    use_metadata_index: bool,
    use_summary_offsets: bool,
    repeat_schemas: bool,
    repeat_channels: bool,
    include_crcs: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            #[cfg(feature = "zstd")]
            compression: Some(Compression::Zstd),
            #[cfg(not(feature = "zstd"))]
            compression: None,
            profile: String::new(),
            chunk_size: Some(1024 * 768),
            use_chunks: true,
            use_message_index: true,
            use_chunk_index: true,
            use_statistics: true,
            use_attachment_index: true,
            use_metadata_index: true,
            use_summary_offsets: true,
            repeat_schemas: true,
            repeat_channels: true,
            include_crcs: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the compression that should be used on chunks.
    pub fn compression(self, compression: Option<Compression>) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// specifies the profile that should be written to the MCAP Header record.
    pub fn profile<S: Into<String>>(self, profile: S) -> Self {
        Self {
            profile: profile.into(),
            ..self
        }
    }

    /// specifies the target uncompressed size of each chunk.
    ///
    /// Messages will be written to chunks until the uncompressed chunk is larger than the
    /// target chunk size, at which point the chunk will be closed and a new one started.
    /// If `None`, chunks will not be automatically closed and the user must call `flush()` to
    /// begin a new chunk.
    pub fn chunk_size(self, chunk_size: Option<u64>) -> Self {
        Self { chunk_size, ..self }
    }

    /// specifies whether to use chunks for storing messages.
    ///
    /// If `false`, messages will be written directly to the data section of the file.
    /// This prevents using compression or indexing, but may be useful on small embedded systems
    /// that cannot afford the memory overhead of storing chunk metadata for the entire recording.
    ///
    /// Disabling this also forces `use_message_index` and `use_chunk_index` off, since both
    /// only make sense relative to a chunk.
    pub fn use_chunks(self, use_chunks: bool) -> Self {
        Self {
            use_chunks,
            use_message_index: self.use_message_index && use_chunks,
            use_chunk_index: self.use_chunk_index && use_chunks,
            ..self
        }
    }

    /// Whether to emit a MessageIndex record for each channel after every chunk.
    pub fn use_message_index(self, use_message_index: bool) -> Self {
        Self {
            use_message_index: use_message_index && self.use_chunks,
            ..self
        }
    }

    /// Whether to collect a ChunkIndex entry for each chunk, written to the summary.
    pub fn use_chunk_index(self, use_chunk_index: bool) -> Self {
        Self {
            use_chunk_index: use_chunk_index && self.use_chunks,
            ..self
        }
    }

    /// Whether to maintain running counts/time bounds and emit a Statistics record.
    pub fn use_statistics(self, use_statistics: bool) -> Self {
        Self {
            use_statistics,
            ..self
        }
    }

    /// Whether to emit AttachmentIndex records in the summary.
    pub fn use_attachment_index(self, use_attachment_index: bool) -> Self {
        Self {
            use_attachment_index,
            ..self
        }
    }

    /// Whether to emit MetadataIndex records in the summary.
    pub fn use_metadata_index(self, use_metadata_index: bool) -> Self {
        Self {
            use_metadata_index,
            ..self
        }
    }

    /// Whether to emit SummaryOffset records after the summary.
    pub fn use_summary_offsets(self, use_summary_offsets: bool) -> Self {
        Self {
            use_summary_offsets,
            ..self
        }
    }

    /// Whether to re-emit Schema records in the summary section.
    pub fn repeat_schemas(self, repeat_schemas: bool) -> Self {
        Self {
            repeat_schemas,
            ..self
        }
    }

    /// Whether to re-emit Channel records in the summary section.
    pub fn repeat_channels(self, repeat_channels: bool) -> Self {
        Self {
            repeat_channels,
            ..self
        }
    }

    /// Whether to compute the uncompressed-chunk, data-section, and summary CRCs.
    ///
    /// When `false`, those fields are written as `0`, which readers are required to treat as
    /// "validation skipped".
    pub fn include_crcs(self, include_crcs: bool) -> Self {
        Self {
            include_crcs,
            ..self
        }
    }

    /// Creates a [`Writer`] which writes to `w` using the given options.
    pub fn create<W: Write>(self, w: W) -> McapResult<Writer<W>> {
        Writer::with_options(w, self)
    }
}

/// The deduplication key for a channel: two calls that describe the same channel return the
/// same ID instead of writing a second `Channel` record.
#[derive(Hash, PartialEq, Eq, Clone)]
struct ChannelContent {
    topic: String,
    schema_id: u16,
    message_encoding: String,
    metadata: BTreeMap<String, String>,
}

/// The deduplication key for a schema, analogous to [`ChannelContent`].
#[derive(Hash, PartialEq, Eq, Clone)]
struct SchemaContent {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

/// Writes an MCAP file to the given [writer](Write).
///
/// Users should call [`finish()`](Self::finish) to flush the stream
/// and check for errors when done; otherwise the result will be unwrapped on drop.
pub struct Writer<W: Write> {
    sink: CountingCrcWriter<W>,
    chunk: Option<ChunkWriter>,
    attachment: Option<AttachmentWriter>,
    ended: bool,
    append_mode: bool,
    options: WriteOptions,
    schemas: BiHashMap<SchemaContent, u16>,
    channels: BiHashMap<ChannelContent, u16>,
    /// IDs of schemas that have been written to the stream already. Registering a schema (via
    /// [`Self::add_schema`] or implicitly via [`Self::write`]) only reserves an ID; the actual
    /// Schema record isn't emitted until the first message on a channel that uses it.
    emitted_schemas: std::collections::BTreeSet<u16>,
    /// Same as `emitted_schemas`, but for channels.
    emitted_channels: std::collections::BTreeSet<u16>,
    next_schema_id: u16,
    next_channel_id: u16,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    /// Message start and end time, or None if there are no messages yet.
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
}

impl<W: Write> Writer<W> {
    pub fn new(writer: W) -> McapResult<Self> {
        Self::with_options(writer, WriteOptions::default())
    }

    fn with_options(writer: W, opts: WriteOptions) -> McapResult<Self> {
        let mut header_writer = CountingWriter::new(writer);
        header_writer.write_all(MAGIC)?;
        write_record(
            &mut header_writer,
            &Record::Header(records::Header {
                profile: opts.profile.clone(),
                library: String::from("logcap-") + env!("CARGO_PKG_VERSION"),
            }),
        )?;
        let data_section_start = header_writer.position();
        let sink =
            CountingCrcWriter::with_start_position(header_writer.into_inner(), data_section_start);

        Ok(Self::new_started(sink, opts, false))
    }

    fn new_started(sink: CountingCrcWriter<W>, opts: WriteOptions, append_mode: bool) -> Self {
        Self {
            sink,
            chunk: None,
            attachment: None,
            ended: false,
            append_mode,
            options: opts,
            schemas: Default::default(),
            channels: Default::default(),
            emitted_schemas: Default::default(),
            emitted_channels: Default::default(),
            next_channel_id: 0,
            next_schema_id: 1,
            chunk_indexes: Default::default(),
            attachment_indexes: Default::default(),
            metadata_indexes: Default::default(),
            message_bounds: None,
            channel_message_counts: BTreeMap::new(),
        }
    }

    /// Returns `true` if this writer was created with [`Writer::append`].
    pub fn is_append_mode(&self) -> bool {
        self.append_mode
    }

    /// Adds a schema, returning its ID. If a schema with the same content has been added already,
    /// its ID is returned.
    ///
    /// The Schema record itself isn't written immediately: it's emitted lazily, the first time a
    /// message is written on a channel that references it.
    ///
    /// * `name`: an identifier for the schema.
    /// * `encoding`: Describes the schema format.  The [well-known schema
    ///   encodings](https://mcap.dev/spec/registry#well-known-schema-encodings) are preferred. An
    ///   empty string indicates no schema is available.
    /// * `data`: The serialized schema content. If `encoding` is an empty string, `data` should
    ///   have zero length.
    pub fn add_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> McapResult<u16> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        if let Some(&id) = self.schemas.get_by_left(&SchemaContent {
            name: name.to_owned(),
            encoding: encoding.to_owned(),
            data: data.to_vec(),
        }) {
            return Ok(id);
        }
        while self.schemas.contains_right(&self.next_schema_id) {
            if self.next_schema_id == u16::MAX {
                return Err(McapError::TooManySchemas);
            }
            self.next_schema_id += 1;
        }
        let id = self.next_schema_id;
        self.next_schema_id += 1;
        self.register_schema(
            SchemaContent {
                name: name.to_owned(),
                encoding: encoding.to_owned(),
                data: data.to_vec(),
            },
            id,
        );
        Ok(id)
    }

    /// Records a schema's content against an ID without writing anything to the stream.
    fn register_schema(&mut self, content: SchemaContent, id: u16) {
        self.schemas.insert(content, id);
    }

    /// Writes the Schema record for `id`, if it hasn't been written already.
    fn ensure_schema_emitted(&mut self, id: u16) -> McapResult<()> {
        if id == 0 || self.emitted_schemas.contains(&id) {
            return Ok(());
        }
        let content = self
            .schemas
            .get_by_right(&id)
            .expect("schema id should be registered before being emitted")
            .clone();
        let header = records::SchemaHeader {
            id,
            name: content.name,
            encoding: content.encoding,
        };
        let data = Cow::Owned(content.data);
        if self.options.use_chunks {
            self.chunkin_time()?.write_schema(header, data)?;
        } else {
            write_record(&mut self.sink, &Record::Schema { header, data })?;
        }
        self.emitted_schemas.insert(id);
        Ok(())
    }

    /// Adds a channel, returning its ID. If a channel with equivalent content was added previously,
    /// its ID is returned.
    ///
    /// Useful with subequent calls to [`write_to_known_channel()`](Self::write_to_known_channel).
    ///
    /// The Channel record itself isn't written immediately: it's emitted lazily, the first time a
    /// message is written on this channel.
    ///
    /// * `schema_id`: a schema_id returned from [`Self::add_schema`], or 0 if the channel has no
    ///    schema.
    /// * `topic`: The topic name.
    /// * `message_encoding`: Encoding for messages on this channel. The [well-known message
    ///    encodings](https://mcap.dev/spec/registry#well-known-message-encodings) are preferred.
    ///  * `metadata`: Metadata about this channel.
    pub fn add_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<u16> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        if let Some(&id) = self.channels.get_by_left(&ChannelContent {
            topic: topic.to_owned(),
            schema_id,
            message_encoding: message_encoding.to_owned(),
            metadata: metadata.clone(),
        }) {
            return Ok(id);
        }
        if schema_id != 0 && self.schemas.get_by_right(&schema_id).is_none() {
            return Err(McapError::UnknownSchema(topic.into(), schema_id));
        }

        while self.channels.contains_right(&self.next_channel_id) {
            if self.next_channel_id == u16::MAX {
                return Err(McapError::TooManyChannels);
            }
            self.next_channel_id += 1;
        }
        let id = self.next_channel_id;
        self.next_channel_id += 1;

        self.register_channel(
            ChannelContent {
                topic: topic.to_owned(),
                schema_id,
                message_encoding: message_encoding.to_owned(),
                metadata: metadata.clone(),
            },
            id,
        );
        Ok(id)
    }

    /// Records a channel's content against an ID without writing anything to the stream.
    fn register_channel(&mut self, content: ChannelContent, id: u16) {
        self.channels.insert(content, id);
    }

    /// Writes the Channel record for `id` (and its Schema, if not already emitted), if it hasn't
    /// been written already.
    fn ensure_channel_emitted(&mut self, id: u16) -> McapResult<()> {
        if self.emitted_channels.contains(&id) {
            return Ok(());
        }
        let content = self
            .channels
            .get_by_right(&id)
            .expect("channel id should be registered before being emitted")
            .clone();
        self.ensure_schema_emitted(content.schema_id)?;
        let channel = records::Channel {
            id,
            schema_id: content.schema_id,
            topic: content.topic,
            message_encoding: content.message_encoding,
            metadata: content.metadata,
        };
        if self.options.use_chunks {
            self.chunkin_time()?.write_channel(channel)?;
        } else {
            write_record(&mut self.sink, &Record::Channel(channel))?;
        }
        self.emitted_channels.insert(id);
        Ok(())
    }

    /// Write the given message (and its provided channel, if not already added).
    /// The provided channel ID and schema ID will be used as IDs in the resulting MCAP.
    pub fn write(&mut self, message: &Message) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        if let Some(schema) = message.channel.schema.as_ref() {
            match self.schemas.get_by_right(&schema.id) {
                Some(previous) => {
                    let current = SchemaContent {
                        name: schema.name.clone(),
                        encoding: schema.encoding.clone(),
                        data: schema.data.clone().into_owned(),
                    };
                    if *previous != current {
                        return Err(McapError::ConflictingSchemas(schema.name.clone()));
                    }
                }
                None => {
                    self.register_schema(
                        SchemaContent {
                            name: schema.name.clone(),
                            encoding: schema.encoding.clone(),
                            data: schema.data.clone().into_owned(),
                        },
                        schema.id,
                    );
                }
            }
        }
        let schema_id = match message.channel.schema.as_ref() {
            None => 0,
            Some(schema) => schema.id,
        };
        match self.channels.get_by_right(&message.channel.id) {
            Some(previous) => {
                let current = ChannelContent {
                    topic: message.channel.topic.clone(),
                    schema_id,
                    message_encoding: message.channel.message_encoding.clone(),
                    metadata: message.channel.metadata.clone(),
                };
                if *previous != current {
                    return Err(McapError::ConflictingChannels(
                        message.channel.topic.clone(),
                    ));
                }
            }
            None => {
                self.register_channel(
                    ChannelContent {
                        topic: message.channel.topic.clone(),
                        schema_id,
                        message_encoding: message.channel.message_encoding.clone(),
                        metadata: message.channel.metadata.clone(),
                    },
                    message.channel.id,
                );
            }
        }
        let header = MessageHeader {
            channel_id: message.channel.id,
            sequence: message.sequence,
            log_time: message.log_time,
            publish_time: message.publish_time,
        };
        let data: &[u8] = &message.data;
        self.write_to_known_channel(&header, data)
    }

    /// Write a message to an added channel, given its ID.
    ///
    /// This skips hash lookups of the channel and schema if you already added them.
    pub fn write_to_known_channel(
        &mut self,
        header: &MessageHeader,
        data: &[u8],
    ) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        if self.channels.get_by_right(&header.channel_id).is_none() {
            return Err(McapError::UnknownChannel(
                header.sequence,
                header.channel_id,
            ));
        }

        if self.options.use_statistics {
            self.message_bounds = Some(match self.message_bounds {
                None => (header.log_time, header.log_time),
                Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
            });
            *self
                .channel_message_counts
                .entry(header.channel_id)
                .or_insert(0) += 1;
        }

        // if the current chunk is larger than our target chunk size, finish it
        // and start a new one.
        let current_chunk_size = self.chunk.as_ref().map(ChunkWriter::uncompressed_size);
        if let (Some(current_chunk_size), Some(target)) =
            (current_chunk_size, self.options.chunk_size)
        {
            if current_chunk_size > target {
                self.finish_chunk()?;
            }
        }

        self.ensure_channel_emitted(header.channel_id)?;

        if self.options.use_chunks {
            self.chunkin_time()?.write_message(header, data)?;
        } else {
            write_record(
                &mut self.sink,
                &Record::Message {
                    header: *header,
                    data: Cow::Borrowed(data),
                },
            )?;
        }
        Ok(())
    }

    /// Start writing an attachment.
    ///
    /// This is a low level API. For small attachments, use [`Self::attach`].
    ///
    /// To start writing an attachment call this method with the [`AttachmentHeader`] as well as
    /// the length of the attachment in bytes. It is important this length is exact otherwise the
    /// writer will be left in an error state.
    ///
    /// This call should be followed by one or more calls to [`Self::put_attachment_bytes`].
    ///
    /// Once all attachment bytes have been written the attachment must be completed with a call to
    /// [`Self::finish_attachment`]. Failing to finish the attachment will leave the write in an
    /// error state.
    pub fn start_attachment(
        &mut self,
        attachment_length: u64,
        header: AttachmentHeader,
    ) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        self.finish_chunk()?;

        if self.attachment.is_some() {
            return Err(McapError::AttachmentNotInProgress);
        }

        self.attachment = Some(AttachmentWriter::new(
            &mut self.sink,
            attachment_length,
            header,
        )?);

        Ok(())
    }

    /// Write bytes to the current attachment.
    ///
    /// This is a low level API. For small attachments, use [`Self::attach`].
    ///
    /// Before calling this method call [`Self::start_attachment`].
    pub fn put_attachment_bytes(&mut self, bytes: &[u8]) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        let Some(writer) = &mut self.attachment else {
            return Err(McapError::AttachmentNotInProgress);
        };

        writer.put_bytes(&mut self.sink, bytes)
    }

    /// Finish the current attachment.
    ///
    /// This is a low level API. For small attachments, use [`Self::attach`].
    ///
    /// Before calling this method call [`Self::start_attachment`] and write bytes to the
    /// attachment using [`Self::put_attachment_bytes`].
    pub fn finish_attachment(&mut self) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        let Some(writer) = self.attachment.take() else {
            return Err(McapError::AttachmentNotInProgress);
        };

        let attachment_index = writer.finish(&mut self.sink)?;

        if self.options.use_attachment_index {
            self.attachment_indexes.push(attachment_index);
        }

        Ok(())
    }

    /// Write an attachment to the MCAP file. This finishes any current chunk before writing the
    /// attachment.
    pub fn attach(&mut self, attachment: &Attachment) -> McapResult<()> {
        let header = records::AttachmentHeader {
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        };

        self.start_attachment(attachment.data.len() as _, header)?;
        self.put_attachment_bytes(&attachment.data[..])?;
        self.finish_attachment()?;

        Ok(())
    }

    /// Write a [Metadata](https://mcap.dev/spec#metadata-op0x0c) record to the MCAP file. This
    /// finishes any current chunk before writing the metadata.
    pub fn write_metadata(&mut self, metadata: &Metadata) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        self.finish_chunk()?;
        let offset = self.sink.position();

        write_record(&mut self.sink, &Record::Metadata(metadata.clone()))?;

        let length = self.sink.position() - offset;

        if self.options.use_metadata_index {
            self.metadata_indexes.push(records::MetadataIndex {
                offset,
                length,
                name: metadata.name.clone(),
            });
        }

        Ok(())
    }

    /// Finishes the current chunk, if we have one, and flushes the underlying
    /// [writer](Write).
    ///
    /// We finish the chunk to guarantee that the file can be streamed by future
    /// readers at least up to this point.
    /// (The alternative is to just flush the writer mid-chunk.
    /// But if we did that, and then writing was suddenly interrupted afterwards,
    /// readers would have to try to recover a half-written chunk,
    /// probably with an unfinished compresion stream.)
    ///
    /// Note that lossless compression schemes like LZ4 and Zstd improve
    /// as they go, so larger chunks will tend to have better compression.
    pub fn flush(&mut self) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        self.finish_chunk()?;
        self.sink.flush()?;
        Ok(())
    }

    /// Starts a new chunk if we haven't done so already.
    fn chunkin_time(&mut self) -> McapResult<&mut ChunkWriter> {
        if self.attachment.is_some() {
            return Err(McapError::AttachmentNotInProgress);
        }

        assert!(
            self.options.use_chunks,
            "Trying to write to a chunk when chunking is disabled"
        );

        if self.chunk.is_none() {
            self.chunk = Some(ChunkWriter::new(self.options.compression)?);
        }

        Ok(self.chunk.as_mut().expect("just inserted"))
    }

    /// Finish the current chunk, if we have one.
    fn finish_chunk(&mut self) -> McapResult<()> {
        if self.attachment.is_some() {
            return Err(McapError::AttachmentNotInProgress);
        }

        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };

        let index = chunk.finish(&mut self.sink, &self.options)?;
        if self.options.use_chunk_index {
            self.chunk_indexes.push(index);
        }
        Ok(())
    }

    /// Finishes any current chunk and writes out the rest of the file.
    ///
    /// A second call returns [`McapError::AlreadyEnded`] rather than writing anything again; so
    /// does any other method called after this one succeeds.
    pub fn finish(&mut self) -> McapResult<()> {
        if self.ended {
            return Err(McapError::AlreadyEnded);
        }
        self.ended = true;

        self.finish_chunk()?;

        let data_section_crc = if self.options.include_crcs {
            self.sink.snapshot_crc()
        } else {
            0
        };
        write_record(
            &mut self.sink,
            &Record::DataEnd(records::DataEnd { data_section_crc }),
        )?;

        let mut channel_message_counts = BTreeMap::new();
        std::mem::swap(
            &mut channel_message_counts,
            &mut self.channel_message_counts,
        );

        let message_bounds = self.message_bounds.unwrap_or((0, 0));
        let stats = records::Statistics {
            message_count: channel_message_counts.values().sum(),
            schema_count: self.schemas.len() as u16,
            channel_count: self.channels.len() as u32,
            attachment_count: self.attachment_indexes.len() as u32,
            metadata_count: self.metadata_indexes.len() as u32,
            chunk_count: self.chunk_indexes.len() as u32,
            message_start_time: message_bounds.0,
            message_end_time: message_bounds.1,
            channel_message_counts,
        };

        let mut chunk_indexes = Vec::new();
        std::mem::swap(&mut chunk_indexes, &mut self.chunk_indexes);

        let mut attachment_indexes = Vec::new();
        std::mem::swap(&mut attachment_indexes, &mut self.attachment_indexes);

        let mut metadata_indexes = Vec::new();
        std::mem::swap(&mut metadata_indexes, &mut self.metadata_indexes);

        let all_channels: Vec<_> = self
            .channels
            .iter()
            .map(|(content, &id)| records::Channel {
                id,
                schema_id: content.schema_id,
                topic: content.topic.clone(),
                message_encoding: content.message_encoding.clone(),
                metadata: content.metadata.clone(),
            })
            .collect();
        let all_schemas: Vec<_> = self
            .schemas
            .iter()
            .map(|(content, &id)| Record::Schema {
                header: records::SchemaHeader {
                    id,
                    name: content.name.clone(),
                    encoding: content.encoding.clone(),
                },
                data: Cow::Owned(content.data.clone()),
            })
            .collect();

        let mut offsets = Vec::new();

        let summary_start = self.sink.position();

        // Let's get a CRC of the summary section, on top of the data section's own running one.
        let mut ccw = CountingCrcWriter::with_start_position(&mut self.sink, summary_start);

        // Write all schemas.
        let schemas_start = summary_start;
        if self.options.repeat_schemas {
            for schema in all_schemas.iter() {
                write_record(&mut ccw, schema)?;
            }
        }
        let schemas_end = ccw.position();
        if schemas_end - schemas_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::SCHEMA,
                group_start: schemas_start,
                group_length: schemas_end - schemas_start,
            });
        }

        // Write all channels.
        let channels_start = schemas_end;
        if self.options.repeat_channels {
            for channel in all_channels {
                write_record(&mut ccw, &Record::Channel(channel))?;
            }
        }
        let channels_end = ccw.position();
        if channels_end - channels_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::CHANNEL,
                group_start: channels_start,
                group_length: channels_end - channels_start,
            });
        }

        // ...chunk indexes...
        let chunk_indexes_start = channels_end;
        if self.options.use_chunk_index {
            for index in chunk_indexes {
                write_record(&mut ccw, &Record::ChunkIndex(index))?;
            }
        }
        let chunk_indexes_end = ccw.position();
        if chunk_indexes_end - chunk_indexes_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::CHUNK_INDEX,
                group_start: chunk_indexes_start,
                group_length: chunk_indexes_end - chunk_indexes_start,
            });
        }

        // ...and attachment indexes
        let attachment_indexes_start = chunk_indexes_end;
        for index in attachment_indexes {
            write_record(&mut ccw, &Record::AttachmentIndex(index))?;
        }
        let attachment_indexes_end = ccw.position();
        if attachment_indexes_end - attachment_indexes_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::ATTACHMENT_INDEX,
                group_start: attachment_indexes_start,
                group_length: attachment_indexes_end - attachment_indexes_start,
            });
        }

        // ...and metadata indexes
        let metadata_indexes_start = attachment_indexes_end;
        for index in metadata_indexes {
            write_record(&mut ccw, &Record::MetadataIndex(index))?;
        }
        let metadata_indexes_end = ccw.position();
        if metadata_indexes_end - metadata_indexes_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::METADATA_INDEX,
                group_start: metadata_indexes_start,
                group_length: metadata_indexes_end - metadata_indexes_start,
            });
        }

        let stats_start = metadata_indexes_end;
        if self.options.use_statistics {
            write_record(&mut ccw, &Record::Statistics(stats))?;
        }
        let stats_end = ccw.position();
        if stats_end - stats_start > 0 {
            offsets.push(records::SummaryOffset {
                group_opcode: op::STATISTICS,
                group_start: stats_start,
                group_length: stats_end - stats_start,
            });
        }

        // Write the summary offsets we've been accumulating
        let summary_offset_start = stats_end;
        if self.options.use_summary_offsets {
            for offset in offsets {
                write_record(&mut ccw, &Record::SummaryOffset(offset))?;
            }
        }

        // The CRC in the footer _includes_ part of the footer.
        op_and_len(&mut ccw, op::FOOTER, 20)?;
        ccw.write_u64::<LE>(summary_start)?;
        ccw.write_u64::<LE>(summary_offset_start)?;

        let summary_crc = if self.options.include_crcs {
            ccw.finalize().1
        } else {
            ccw.finalize();
            0
        };

        self.sink.write_u32::<LE>(summary_crc)?;
        self.sink.write_all(MAGIC)?;
        self.sink.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

impl Writer<std::fs::File> {
    /// Opens an existing MCAP file for appending.
    ///
    /// This rebuilds the schema and channel registries by replaying the records before the
    /// summary section, truncates away the previous `DataEnd` record (and anything after it),
    /// and resumes writing from there. The file is expected to have been produced by this
    /// writer or one compatible with it; a file with no proper `DataEnd` (e.g. one left behind
    /// by a crash) is resumed from the last complete record found.
    pub fn append(mut file: std::fs::File) -> McapResult<Self> {
        use std::io::{Seek, SeekFrom};

        file.rewind()?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(McapError::BadMagic);
        }

        let mut schemas = BiHashMap::new();
        let mut channels = BiHashMap::new();
        let mut emitted_schemas = std::collections::BTreeSet::new();
        let mut emitted_channels = std::collections::BTreeSet::new();
        let mut next_schema_id = 1u16;
        let mut next_channel_id = 0u16;

        let mut pos = MAGIC.len() as u64;
        let mut truncate_at = pos;

        loop {
            let mut op_buf = [0u8; 1];
            match file.read(&mut op_buf)? {
                0 => break,
                _ => {}
            }
            let op = op_buf[0];

            let mut len_buf = [0u8; 8];
            file.read_exact(&mut len_buf)?;
            let len = u64::from_le_bytes(len_buf);

            let record_start = pos;
            pos += 1 + 8 + len;

            let mut body = vec![0u8; len as usize];
            file.read_exact(&mut body)?;

            match op {
                op::SCHEMA => {
                    if let Record::Schema { header, data } = crate::read::parse_record(op, &body)? {
                        let id = header.id;
                        schemas.insert(
                            SchemaContent {
                                name: header.name,
                                encoding: header.encoding,
                                data: data.into_owned(),
                            },
                            id,
                        );
                        emitted_schemas.insert(id);
                        next_schema_id = next_schema_id.max(id.wrapping_add(1));
                    }
                }
                op::CHANNEL => {
                    if let Record::Channel(c) = crate::read::parse_record(op, &body)? {
                        let id = c.id;
                        channels.insert(
                            ChannelContent {
                                topic: c.topic,
                                schema_id: c.schema_id,
                                message_encoding: c.message_encoding,
                                metadata: c.metadata,
                            },
                            id,
                        );
                        emitted_channels.insert(id);
                        next_channel_id = next_channel_id.max(id.wrapping_add(1));
                    }
                }
                op::CHUNK => {
                    let mut cursor = Cursor::new(&body[..]);
                    let header: records::ChunkHeader = cursor.read_le()?;
                    let header_len = cursor.position() as usize;
                    let compressed = &body[header_len..];
                    for record in crate::read::ChunkReader::new(header, compressed)? {
                        match record? {
                            Record::Schema { header, data } => {
                                let id = header.id;
                                schemas.insert(
                                    SchemaContent {
                                        name: header.name,
                                        encoding: header.encoding,
                                        data: data.into_owned(),
                                    },
                                    id,
                                );
                                emitted_schemas.insert(id);
                                next_schema_id = next_schema_id.max(id.wrapping_add(1));
                            }
                            Record::Channel(c) => {
                                let id = c.id;
                                channels.insert(
                                    ChannelContent {
                                        topic: c.topic,
                                        schema_id: c.schema_id,
                                        message_encoding: c.message_encoding,
                                        metadata: c.metadata,
                                    },
                                    id,
                                );
                                emitted_channels.insert(id);
                                next_channel_id = next_channel_id.max(id.wrapping_add(1));
                            }
                            _ => {}
                        }
                    }
                }
                op::DATA_END => {
                    truncate_at = record_start;
                    break;
                }
                _ => {}
            }

            truncate_at = pos;
        }

        file.seek(SeekFrom::Start(truncate_at))?;
        file.set_len(truncate_at)?;

        let sink = CountingCrcWriter::with_start_position(file, truncate_at);
        let mut writer = Self::new_started(sink, WriteOptions::default(), true);
        writer.schemas = schemas;
        writer.channels = channels;
        writer.emitted_schemas = emitted_schemas;
        writer.emitted_channels = emitted_channels;
        writer.next_schema_id = next_schema_id;
        writer.next_channel_id = next_channel_id;
        Ok(writer)
    }
}

enum Compressor<W: Write> {
    Null(W),
    #[cfg(feature = "zstd")]
    Zstd(zstd::Encoder<'static, W>),
    #[cfg(feature = "lz4")]
    Lz4(lz4::Encoder<W>),
}

impl<W: Write> Compressor<W> {
    fn finish(self) -> io::Result<W> {
        Ok(match self {
            Compressor::Null(w) => w,
            #[cfg(feature = "zstd")]
            Compressor::Zstd(w) => w.finish()?,
            #[cfg(feature = "lz4")]
            Compressor::Lz4(w) => {
                let (output, result) = w.finish();
                result?;
                output
            }
        })
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Null(w) => w.write(buf),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(w) => w.write(buf),
            #[cfg(feature = "lz4")]
            Compressor::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Null(w) => w.flush(),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(w) => w.flush(),
            #[cfg(feature = "lz4")]
            Compressor::Lz4(w) => w.flush(),
        }
    }
}

/// Accumulates one chunk's worth of Schema/Channel/Message records (plus per-channel message
/// indexes) entirely in memory, since our [`Sink`] can't seek back to patch up a header.
///
/// Buffering the whole chunk is the only mode this writer supports: a chunk's header carries
/// its compressed and uncompressed lengths, which aren't known until every record in it has
/// been written.
struct ChunkWriter {
    message_bounds: Option<(u64, u64)>,
    compression_name: &'static str,
    compressor: CountingCrcWriter<Compressor<Vec<u8>>>,
    indexes: BTreeMap<u16, Vec<records::MessageIndexEntry>>,
}

impl ChunkWriter {
    fn new(compression: Option<Compression>) -> McapResult<Self> {
        let compression_name = compression.map(Compression::name).unwrap_or("");
        let inner = match compression {
            #[cfg(feature = "zstd")]
            Some(Compression::Zstd) => {
                #[allow(unused_mut)]
                let mut enc = zstd::Encoder::new(Vec::new(), 0)?;
                #[cfg(not(target_arch = "wasm32"))]
                enc.multithread(num_cpus::get_physical() as u32)?;
                Compressor::Zstd(enc)
            }
            #[cfg(feature = "lz4")]
            Some(Compression::Lz4) => Compressor::Lz4(
                lz4::EncoderBuilder::new()
                    // Disable the block checksum for wider compatibility with MCAP tooling;
                    // the chunk already carries its own CRC over the uncompressed content.
                    .block_checksum(lz4::liblz4::BlockChecksum::NoBlockChecksum)
                    .build(Vec::new())?,
            ),
            None => Compressor::Null(Vec::new()),
        };
        Ok(Self {
            compressor: CountingCrcWriter::new(inner),
            compression_name,
            message_bounds: None,
            indexes: BTreeMap::new(),
        })
    }

    fn uncompressed_size(&self) -> u64 {
        self.compressor.position()
    }

    fn write_schema(&mut self, header: records::SchemaHeader, data: Cow<[u8]>) -> McapResult<()> {
        write_record(&mut self.compressor, &Record::Schema { header, data })?;
        Ok(())
    }

    fn write_channel(&mut self, chan: records::Channel) -> McapResult<()> {
        write_record(&mut self.compressor, &Record::Channel(chan))?;
        Ok(())
    }

    fn write_message(&mut self, header: &MessageHeader, data: &[u8]) -> McapResult<()> {
        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });

        self.indexes
            .entry(header.channel_id)
            .or_default()
            .push(records::MessageIndexEntry {
                log_time: header.log_time,
                offset: self.compressor.position(),
            });

        write_record(
            &mut self.compressor,
            &Record::Message {
                header: *header,
                data: Cow::Borrowed(data),
            },
        )?;
        Ok(())
    }

    /// Writes the completed Chunk record (and, if configured, its MessageIndex records) to
    /// `sink` at its current position, returning the [`ChunkIndex`](records::ChunkIndex) entry
    /// for the summary.
    fn finish<W: Write>(
        self,
        sink: &mut CountingCrcWriter<W>,
        opts: &WriteOptions,
    ) -> McapResult<records::ChunkIndex> {
        let uncompressed_size = self.compressor.position();
        let (compressor, crc) = self.compressor.finalize();
        let uncompressed_crc = if opts.include_crcs { crc } else { 0 };
        let compressed = compressor.finish()?;

        let message_bounds = self.message_bounds.unwrap_or((0, 0));
        let header = records::ChunkHeader {
            message_start_time: message_bounds.0,
            message_end_time: message_bounds.1,
            uncompressed_size,
            uncompressed_crc,
            compression: String::from(self.compression_name),
            compressed_size: compressed.len() as u64,
        };
        let mut header_buf = Vec::new();
        Cursor::new(&mut header_buf).write_le(&header)?;

        let chunk_start_offset = sink.position();
        op_and_len(
            sink,
            op::CHUNK,
            (header_buf.len() + compressed.len()) as u64,
        )?;
        sink.write_all(&header_buf)?;
        sink.write_all(&compressed)?;
        let data_end = sink.position();

        let mut message_index_offsets: BTreeMap<u16, u64> = BTreeMap::new();
        if opts.use_message_index {
            let mut index_buf = Vec::new();
            for (channel_id, records) in self.indexes {
                message_index_offsets.insert(channel_id, sink.position());
                index_buf.clear();
                let index = records::MessageIndex {
                    channel_id,
                    records,
                };
                Cursor::new(&mut index_buf).write_le(&index)?;
                op_and_len(sink, op::MESSAGE_INDEX, index_buf.len() as _)?;
                sink.write_all(&index_buf)?;
            }
        }
        let end_of_indexes = sink.position();

        Ok(records::ChunkIndex {
            message_start_time: header.message_start_time,
            message_end_time: header.message_end_time,
            chunk_start_offset,
            chunk_length: data_end - chunk_start_offset,
            message_index_offsets,
            message_index_length: end_of_indexes - data_end,
            compression: header.compression,
            compressed_size: header.compressed_size,
            uncompressed_size: header.uncompressed_size,
        })
    }
}

struct AttachmentWriter {
    record_offset: u64,
    attachment_length: u64,
    written: u64,
    header: AttachmentHeader,
    hasher: crc32fast::Hasher,
}

impl AttachmentWriter {
    /// Create a new [`AttachmentWriter`] and write the attachment header to the output.
    fn new<W: Write>(
        sink: &mut CountingCrcWriter<W>,
        attachment_length: u64,
        header: AttachmentHeader,
    ) -> McapResult<Self> {
        let record_offset = sink.position();

        let mut header_buf = vec![];
        Cursor::new(&mut header_buf).write_le(&header)?;

        op_and_len(
            sink,
            op::ATTACHMENT,
            header_buf.len() as u64
                + size_of::<u64>() as u64
                + attachment_length
                + size_of::<u32>() as u64,
        )?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_buf);
        sink.write_all(&header_buf)?;

        let len_bytes = attachment_length.to_le_bytes();
        hasher.update(&len_bytes);
        sink.write_all(&len_bytes)?;

        Ok(Self {
            record_offset,
            attachment_length,
            written: 0,
            header,
            hasher,
        })
    }

    /// Write bytes to the attachment.
    ///
    /// This method will return an error if the provided bytes exceed the space remaining in the
    /// attachment.
    fn put_bytes<W: Write>(&mut self, sink: &mut CountingCrcWriter<W>, bytes: &[u8]) -> McapResult<()> {
        let space = self.attachment_length - self.written;
        let byte_length = bytes.len() as u64;

        if byte_length > space {
            return Err(McapError::AttachmentTooLarge {
                excess: byte_length - space,
                attachment_length: self.attachment_length,
            });
        }

        self.hasher.update(bytes);
        sink.write_all(bytes)?;
        self.written += byte_length;
        Ok(())
    }

    /// Finish the attachment and write the CRC to the output, returning the [`AttachmentIndex`]
    /// for the written attachment.
    fn finish<W: Write>(self, sink: &mut CountingCrcWriter<W>) -> McapResult<AttachmentIndex> {
        let expected = self.attachment_length;
        let current = self.written;

        if expected != current {
            return Err(McapError::AttachmentIncomplete { expected, current });
        }

        let crc = self.hasher.finalize();
        sink.write_u32::<LE>(crc)?;

        let offset = self.record_offset;
        let length = sink.position() - offset;

        Ok(AttachmentIndex {
            offset,
            length,
            log_time: self.header.log_time,
            media_type: self.header.media_type,
            name: self.header.name,
            create_time: self.header.create_time,
            data_size: self.attachment_length,
        })
    }
}
