mod common;

use common::*;

use std::io::Cursor;

use anyhow::Result;
use itertools::Itertools;

/// Checks that the writer will automatically close chunks when they hit a target size.
#[test]
fn auto_cut_chunks() -> Result<()> {
    let mapped = mcap_test_file()?;

    let messages = logcap::MessageStream::new(&mapped)?;

    let mut tmp: Vec<u8> = Vec::new();
    // Setting chunk size to 0 ensures that each message gets written to a new chunk.
    {
        let mut writer = logcap::WriteOptions::new()
            .chunk_size(Some(0))
            .create(Cursor::new(&mut tmp))?;

        for m in messages {
            writer.write(&m?)?;
        }
    }

    // ensure that all messages can be read in the new MCAP, and match the original
    for (theirs, ours) in logcap::MessageStream::new(&mapped)?.zip_eq(logcap::MessageStream::new(&tmp)?) {
        assert_eq!(ours?, theirs?)
    }

    // ensure that more than one chunk is present in the new MCAP
    let num_chunks = logcap::read::LinearReader::new(&tmp)?
        .filter(|r| matches!(r, Ok(logcap::records::Record::Chunk { .. })))
        .count();
    assert!(num_chunks > 1);

    Ok(())
}
