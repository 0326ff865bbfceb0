//! Streaming ZIP writer
//!
//! Collectors address files by logical path. Entries are written through to
//! an unnamed spool file as they arrive, so the bundle never has to fit in
//! memory (pod logs plus the synthetic load files can reach gigabytes); close
//! finalizes the ZIP and copies the spool to the sink (stdout). The writer
//! sits behind a mutex so collectors never interleave file bodies.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Mutex;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::{Error, Result};

/// The diagnostics bundle under construction
pub struct SupportArchive {
    zip: Mutex<ZipWriter<File>>,
}

impl SupportArchive {
    /// Start an empty archive backed by an unnamed spool file
    pub fn new() -> Result<Self> {
        let spool = tempfile::tempfile()
            .map_err(|err| Error::support_archive(format!("cannot create spool file: {err}")))?;
        Ok(Self {
            zip: Mutex::new(ZipWriter::new(spool)),
        })
    }

    /// Add one file at a logical path; the entry reaches the spool before
    /// this returns
    pub fn add_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut zip = self.zip.lock().map_err(|_| poisoned())?;
        zip.start_file(path, options)
            .map_err(|err| Error::support_archive(format!("cannot start file {path}: {err}")))?;
        zip.write_all(contents)
            .map_err(|err| Error::support_archive(format!("cannot write file {path}: {err}")))?;
        zip.flush()
            .map_err(|err| Error::support_archive(format!("cannot flush file {path}: {err}")))?;
        Ok(())
    }

    /// Finalize the ZIP and copy the spool to the sink. Consumes the archive
    /// so closure happens exactly once.
    pub fn close_into(self, sink: &mut dyn Write) -> Result<()> {
        let zip = self.zip.into_inner().map_err(|_| poisoned())?;
        let mut spool = zip
            .finish()
            .map_err(|err| Error::support_archive(format!("cannot finalize archive: {err}")))?;

        spool
            .seek(SeekFrom::Start(0))
            .and_then(|_| io::copy(&mut spool, sink))
            .and_then(|_| sink.flush())
            .map_err(|err| Error::support_archive(format!("cannot flush archive: {err}")))
    }
}

fn poisoned() -> Error {
    Error::support_archive("archive writer poisoned")
}
