//! Synthetic load files
//!
//! Test harness for the streaming path: fills the bundle with N files of a
//! configurable MiB size so large-archive behavior can be exercised without
//! a large cluster.

use async_trait::async_trait;

use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::Result;

const MIB: usize = 1024 * 1024;

/// Writes synthetic files of a fixed size
pub struct LoadSimCollector {
    files: usize,
    size_mib: usize,
}

impl LoadSimCollector {
    /// `files` files of `size_mib` MiB each
    pub fn new(files: usize, size_mib: usize) -> Self {
        Self { files, size_mib }
    }
}

#[async_trait]
impl Collector for LoadSimCollector {
    fn name(&self) -> &'static str {
        "load-sim"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        let payload = vec![b'A'; self.size_mib * MIB];
        for index in 0..self.files {
            archive.add_file(&format!("load-sim/loadsim-{index}.dat"), &payload)?;
        }
        Ok(())
    }
}
