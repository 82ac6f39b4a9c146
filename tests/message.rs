use std::{borrow::Cow, io::BufWriter, sync::Arc};

use anyhow::Result;
use memmap2::Mmap;
use tempfile::tempfile;

fn sample_channel() -> Arc<logcap::Channel<'static>> {
    Arc::new(logcap::Channel {
        id: 1,
        schema: Some(Arc::new(logcap::Schema {
            id: 1,
            name: String::from("Example"),
            encoding: String::from("c"),
            data: Cow::Borrowed(&[4, 5, 6]),
        })),
        topic: String::from("example"),
        message_encoding: String::from("a"),
        metadata: [(String::from("foo"), String::from("bar"))].into(),
    })
}

fn sample_message() -> logcap::Message<'static> {
    logcap::Message {
        channel: sample_channel(),
        sequence: 10,
        log_time: 2,
        publish_time: 1,
        data: Cow::Borrowed(&[1, 2, 3]),
    }
}

#[test]
fn round_trip() -> Result<()> {
    let mut tmp = tempfile()?;
    let mut writer = logcap::Writer::new(BufWriter::new(&mut tmp))?;
    writer.write(&sample_message())?;
    drop(writer);

    let ours = unsafe { Mmap::map(&tmp) }?;
    let summary = logcap::Summary::read(&ours)?.unwrap();

    let channel = sample_channel();
    let schema = channel.schema.clone().unwrap();

    assert_eq!(summary.stats.as_ref().map(|s| s.message_count), Some(1));
    assert_eq!(summary.stats.as_ref().map(|s| s.channel_count), Some(1));
    assert_eq!(summary.stats.as_ref().map(|s| s.schema_count), Some(1));
    assert_eq!(summary.channels.get(&channel.id), Some(&channel));
    assert_eq!(summary.schemas.get(&schema.id), Some(&schema));

    let messages =
        logcap::MessageStream::new(&ours)?.collect::<logcap::McapResult<Vec<_>>>()?;
    assert_eq!(messages, &[sample_message()]);

    Ok(())
}
