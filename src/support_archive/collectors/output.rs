//! Log drain
//!
//! Must run last: drains the in-memory record buffer into the bundle so that
//! the failures of earlier collectors ship with the archive they broke.

use async_trait::async_trait;

use crate::logging::LogBuffer;
use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::Result;

const LOG_FILE: &str = "support-archive.log";

/// Writes the buffered log records of this very run
pub struct LogDrainCollector {
    buffer: LogBuffer,
}

impl LogDrainCollector {
    /// Collector draining the given buffer
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

#[async_trait]
impl Collector for LogDrainCollector {
    fn name(&self) -> &'static str {
        "support-archive-output"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        archive.add_file(LOG_FILE, &self.buffer.drain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use tracing_subscriber::fmt::MakeWriter;

    #[tokio::test]
    async fn drained_records_land_in_the_bundle() {
        let buffer = LogBuffer::new();
        buffer
            .make_writer()
            .write_all(b"logs collector failed: no pods\n")
            .unwrap();

        let archive = SupportArchive::new().unwrap();
        LogDrainCollector::new(buffer.clone())
            .collect(&archive)
            .await
            .unwrap();
        assert!(buffer.is_empty(), "drain must empty the buffer");

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();
        let mut contents = String::new();
        zip.by_name(LOG_FILE)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("no pods"));
    }
}
