//! Operator version stamp

use async_trait::async_trait;

use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::Result;

const VERSION_FILE: &str = "operator-version.txt";

/// Writes the operator's own version into the bundle
pub struct VersionCollector {
    version: String,
}

impl VersionCollector {
    /// Collector for a fixed version string
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl Collector for VersionCollector {
    fn name(&self) -> &'static str {
        "operator-version"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        archive.add_file(VERSION_FILE, self.version.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[tokio::test]
    async fn version_lands_in_the_bundle() {
        let archive = SupportArchive::new().unwrap();
        VersionCollector::new("1.3.0").collect(&archive).await.unwrap();

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();
        let mut contents = String::new();
        zip.by_name(VERSION_FILE)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "1.3.0");
    }
}
