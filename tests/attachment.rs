use std::{borrow::Cow, io::BufWriter};

use anyhow::Result;
use memmap2::Mmap;
use tempfile::tempfile;

fn sample_attachment() -> logcap::Attachment<'static> {
    logcap::Attachment {
        log_time: 2,
        create_time: 1,
        name: String::from("myFile"),
        media_type: String::from("application/octet-stream"),
        data: Cow::Borrowed(&[1, 2, 3]),
    }
}

#[test]
fn round_trip() -> Result<()> {
    let mut tmp = tempfile()?;
    let mut writer = logcap::Writer::new(BufWriter::new(&mut tmp))?;
    writer.attach(&sample_attachment())?;
    drop(writer);

    let ours = unsafe { Mmap::map(&tmp) }?;

    let attachments = logcap::read::LinearReader::new(&ours)?
        .filter_map(|record| match record.unwrap() {
            logcap::records::Record::Attachment { header, data, .. } => Some((header, data)),
            _ => None,
        })
        .collect::<Vec<_>>();

    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].0.log_time, 2);
    assert_eq!(attachments[0].0.create_time, 1);
    assert_eq!(attachments[0].0.name, "myFile");
    assert_eq!(attachments[0].0.media_type, "application/octet-stream");
    assert_eq!(&attachments[0].1[..], &[1, 2, 3]);

    let summary = logcap::Summary::read(&ours)?.unwrap();
    assert_eq!(
        summary.stats.as_ref().map(|s| s.attachment_count),
        Some(1)
    );
    assert_eq!(summary.attachment_indexes.len(), 1);
    assert_eq!(summary.attachment_indexes[0].name, "myFile");
    assert_eq!(summary.attachment_indexes[0].data_size, 3);

    let read_back = logcap::read::attachment(&ours, &summary.attachment_indexes[0])?;
    assert_eq!(read_back, sample_attachment());

    Ok(())
}
