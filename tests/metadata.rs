use std::io::BufWriter;

use anyhow::Result;
use memmap2::Mmap;
use tempfile::tempfile;

fn sample_metadata() -> logcap::records::Metadata {
    logcap::records::Metadata {
        name: String::from("myMetadata"),
        metadata: [(String::from("foo"), String::from("bar"))].into(),
    }
}

#[test]
fn round_trip() -> Result<()> {
    let mut tmp = tempfile()?;
    let mut writer = logcap::Writer::new(BufWriter::new(&mut tmp))?;
    writer.write_metadata(&sample_metadata())?;
    drop(writer);

    let ours = unsafe { Mmap::map(&tmp) }?;

    let metas = logcap::read::LinearReader::new(&ours)?
        .filter_map(|record| match record.unwrap() {
            logcap::records::Record::Metadata(m) => Some(m),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(metas, &[sample_metadata()]);

    let summary = logcap::Summary::read(&ours)?.unwrap();
    assert_eq!(summary.stats.as_ref().map(|s| s.metadata_count), Some(1));
    assert_eq!(summary.metadata_indexes.len(), 1);
    assert_eq!(summary.metadata_indexes[0].name, "myMetadata");

    let read_back = logcap::read::metadata(&ours, &summary.metadata_indexes[0])?;
    assert_eq!(read_back, sample_metadata());

    Ok(())
}
