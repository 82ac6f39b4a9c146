mod common;

use common::*;

use std::io::BufWriter;

use anyhow::Result;
use itertools::Itertools;
use memmap2::Mmap;
use tempfile::tempfile;

fn round_trip(comp: Option<logcap::Compression>) -> Result<()> {
    let mapped = mcap_test_file()?;

    let mut tmp = tempfile()?;
    let mut writer = logcap::WriteOptions::new()
        .compression(comp)
        .profile("fooey")
        .create(BufWriter::new(&mut tmp))?;

    for m in logcap::MessageStream::new(&mapped)? {
        // IRL, we'd add channels, then write messages to known channels,
        // which skips having to re-hash the channel and its schema each time.
        // But since here we'd need to do the same anyways...
        writer.write(&m?)?;
    }
    drop(writer);

    let ours = unsafe { Mmap::map(&tmp) }?;

    // Compare the message stream of our MCAP to the reference one.
    for (theirs, ours) in
        logcap::MessageStream::new(&mapped)?.zip_eq(logcap::MessageStream::new(&ours)?)
    {
        assert_eq!(ours?, theirs?)
    }

    Ok(())
}

#[test]
fn uncompressed_round_trip() -> Result<()> {
    round_trip(None)
}

#[cfg(feature = "zstd")]
#[test]
fn zstd_round_trip() -> Result<()> {
    round_trip(Some(logcap::Compression::Zstd))
}

#[cfg(feature = "lz4")]
#[test]
fn lz4_round_trip() -> Result<()> {
    round_trip(Some(logcap::Compression::Lz4))
}
