use std::{borrow::Cow, fs, io::BufWriter, sync::Arc};

use anyhow::{Context, Result};
use camino::Utf8Path;
use memmap2::Mmap;
use tempfile::tempfile;

pub fn map_mcap<P: AsRef<Utf8Path>>(p: P) -> Result<Mmap> {
    let p = p.as_ref();
    let fd = fs::File::open(p).with_context(|| format!("Couldn't open {p}"))?;
    unsafe { Mmap::map(&fd) }.with_context(|| format!("Couldn't map {p}"))
}

/// Builds a small multi-chunk, multi-channel fixture MCAP in memory and maps it back in,
/// for tests that just need "some realistic file" to read back.
pub fn mcap_test_file() -> Result<Mmap> {
    let mut tmp = tempfile()?;
    {
        let mut writer =
            logcap::WriteOptions::new().create(BufWriter::new(&mut tmp))?;

        let schema = writer.add_schema("Example", "c", &[4, 5, 6])?;
        let ch_a = writer.add_channel(schema, "alpha", "a", &Default::default())?;
        let ch_b = writer.add_channel(schema, "beta", "a", &Default::default())?;

        let channel_a = Arc::new(logcap::Channel {
            id: ch_a,
            topic: String::from("alpha"),
            schema: Some(Arc::new(logcap::Schema {
                id: schema,
                name: String::from("Example"),
                encoding: String::from("c"),
                data: Cow::Borrowed(&[4, 5, 6]),
            })),
            message_encoding: String::from("a"),
            metadata: Default::default(),
        });
        let channel_b = Arc::new(logcap::Channel {
            id: ch_b,
            topic: String::from("beta"),
            schema: channel_a.schema.clone(),
            message_encoding: String::from("a"),
            metadata: Default::default(),
        });

        for (channel, seq, log_time) in [
            (&channel_a, 0u32, 20u64),
            (&channel_b, 0u32, 10u64),
            (&channel_a, 1u32, 30u64),
            (&channel_b, 1u32, 25u64),
        ] {
            writer.write(&logcap::Message {
                channel: channel.clone(),
                sequence: seq,
                log_time,
                publish_time: log_time,
                data: Cow::Borrowed(&[1, 2, 3]),
            })?;
            // Force each message into its own chunk so tests exercising multi-chunk
            // behavior (chunk indexes, random access) have more than one to work with.
            writer.flush()?;
        }

        writer.finish()?;
    }

    let mapped = unsafe { Mmap::map(&tmp) }.context("couldn't map generated fixture")?;
    Ok(mapped)
}
