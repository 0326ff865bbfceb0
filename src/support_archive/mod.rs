//! Support-archive pipeline
//!
//! `support-archive` streams a diagnostics ZIP to stdout: operator version,
//! pod logs, on-disk logs, manifests of everything the operator touches, and
//! self-check results. Collectors are isolated from each other; one failing
//! collector is logged (into the bundle itself, via the log buffer) and the
//! rest keep running. The archive is closed exactly once, whatever happened
//! before.

pub mod archive;
pub mod collectors;

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{error, info};

use crate::logging::LogBuffer;
use crate::Result;
use archive::SupportArchive;

/// One isolated step of the pipeline
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable name used in log records
    fn name(&self) -> &'static str;

    /// Gather data and add files to the archive
    async fn collect(&self, archive: &SupportArchive) -> Result<()>;
}

/// CLI options of the `support-archive` command
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Namespace the operator components run in
    pub namespace: String,
    /// Seconds to wait before collection starts
    pub delay: u64,
    /// Also collect logs of pods the operator manages (not only its own)
    pub managed_logs: bool,
    /// Size in MiB of each synthetic load file
    pub loadsim_file_size: usize,
    /// Number of synthetic load files; 0 disables the load simulation
    pub loadsim_files: usize,
    /// Cap on collected warning events
    pub num_events: u32,
}

/// Run the collectors in order, isolating failures
pub async fn run_collectors(collectors: Vec<Box<dyn Collector>>, archive: &SupportArchive) {
    for collector in collectors {
        info!(collector = collector.name(), "collecting");
        if let Err(err) = collector.collect(archive).await {
            error!(collector = collector.name(), error = %err, "collector failed, continuing");
        }
    }
}

/// Assemble the collector pipeline, run it, and stream the bundle to `sink`.
///
/// The log-drain collector runs last so the bundle carries the records of
/// everything before it.
pub async fn execute(
    client: Client,
    options: &ArchiveOptions,
    version: &str,
    buffer: LogBuffer,
    sink: &mut dyn Write,
) -> Result<()> {
    if options.delay > 0 {
        info!(seconds = options.delay, "delaying collection");
        tokio::time::sleep(Duration::from_secs(options.delay)).await;
    }

    let archive = SupportArchive::new()?;

    let mut pipeline: Vec<Box<dyn Collector>> = vec![
        Box::new(collectors::version::VersionCollector::new(version)),
        Box::new(collectors::logs::LogCollector::new(
            client.clone(),
            &options.namespace,
            options.managed_logs,
        )),
        Box::new(collectors::fs_logs::FsLogCollector::new(
            client.clone(),
            &options.namespace,
        )),
        Box::new(collectors::k8s_objects::KubernetesObjectsCollector::new(
            client.clone(),
            &options.namespace,
            options.num_events,
        )),
        Box::new(collectors::troubleshoot::TroubleshootCollector::new(
            client,
            &options.namespace,
        )),
    ];
    if options.loadsim_files > 0 {
        pipeline.push(Box::new(collectors::load_sim::LoadSimCollector::new(
            options.loadsim_files,
            options.loadsim_file_size,
        )));
    }
    pipeline.push(Box::new(collectors::output::LogDrainCollector::new(buffer)));

    run_collectors(pipeline, &archive).await;

    archive.close_into(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::io::Cursor;

    struct StaticCollector(&'static str, &'static [u8]);

    #[async_trait]
    impl Collector for StaticCollector {
        fn name(&self) -> &'static str {
            "static"
        }
        async fn collect(&self, archive: &SupportArchive) -> Result<()> {
            archive.add_file(self.0, self.1)
        }
    }

    struct BrokenCollector;

    #[async_trait]
    impl Collector for BrokenCollector {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn collect(&self, _: &SupportArchive) -> Result<()> {
            Err(Error::support_archive("api unavailable"))
        }
    }

    /// Story: a broken collector in the middle never costs the files of the
    /// collectors around it
    #[tokio::test]
    async fn broken_collector_is_isolated() {
        let archive = SupportArchive::new().unwrap();
        run_collectors(
            vec![
                Box::new(StaticCollector("before.txt", b"before")),
                Box::new(BrokenCollector),
                Box::new(StaticCollector("after.txt", b"after")),
            ],
            &archive,
        )
        .await;

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();
        assert!(zip.by_name("before.txt").is_ok());
        assert!(zip.by_name("after.txt").is_ok());
    }

    /// Story: a bundle against an in-memory cluster with two DynaKubes, one
    /// EdgeConnect, one operator pod, an injected namespace, and the webhook
    /// configurations lists exactly the agreed files
    #[tokio::test]
    async fn full_bundle_lists_the_expected_files() {
        use collectors::k8s_objects::testing::FakeManifestSource;
        use collectors::k8s_objects::KubernetesObjectsCollector;
        use kube::api::{ApiResource, DynamicObject};

        use crate::crd::{DynaKube, EdgeConnect};
        use crate::{APP_NAME_LABEL, INJECTION_INSTANCE_LABEL, OPERATOR_NAME};

        let namespace_kind = ApiResource::erase::<k8s_openapi::api::core::v1::Namespace>(&());
        let pod_kind = ApiResource::erase::<k8s_openapi::api::core::v1::Pod>(&());
        let configmap_kind = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let dynakube_kind = ApiResource::erase::<DynaKube>(&());
        let edgeconnect_kind = ApiResource::erase::<EdgeConnect>(&());

        let mut source = FakeManifestSource::default()
            .with_webhook_configs()
            .with_crds();
        source.seed(
            "Namespace",
            Some(INJECTION_INSTANCE_LABEL),
            None,
            DynamicObject::new("payments", &namespace_kind),
        );
        source.seed(
            "Namespace",
            None,
            Some("metadata.name=dynatrace"),
            DynamicObject::new("dynatrace", &namespace_kind),
        );
        source.seed(
            "Pod",
            Some(&format!("{APP_NAME_LABEL}={OPERATOR_NAME}")),
            None,
            DynamicObject::new("dynatrace-operator-b7f4c", &pod_kind).within("dynatrace"),
        );
        source.seed(
            "ConfigMap",
            None,
            None,
            DynamicObject::new("deployment-config", &configmap_kind).within("dynatrace"),
        );
        for name in ["dk1", "dk2"] {
            source.seed(
                "DynaKube",
                None,
                None,
                DynamicObject::new(name, &dynakube_kind).within("dynatrace"),
            );
        }
        source.seed(
            "EdgeConnect",
            None,
            None,
            DynamicObject::new("ec1", &edgeconnect_kind).within("dynatrace"),
        );

        let buffer = LogBuffer::new();
        let archive = SupportArchive::new().unwrap();
        run_collectors(
            vec![
                Box::new(collectors::version::VersionCollector::new("1.3.0")),
                Box::new(KubernetesObjectsCollector::with_source(
                    Box::new(source),
                    "dynatrace",
                    300,
                )),
                Box::new(collectors::output::LogDrainCollector::new(buffer)),
            ],
            &archive,
        )
        .await;

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();
        let zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();

        let mut names: Vec<_> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "manifests/crds/customresourcedefinition-dynakubes.yaml",
                "manifests/crds/customresourcedefinition-edgeconnects.yaml",
                "manifests/dynatrace/configmap/deployment-config.yaml",
                "manifests/dynatrace/dynakube/dk1.yaml",
                "manifests/dynatrace/dynakube/dk2.yaml",
                "manifests/dynatrace/edgeconnect/ec1.yaml",
                "manifests/dynatrace/namespace-dynatrace.yaml",
                "manifests/dynatrace/pod/dynatrace-operator-b7f4c.yaml",
                "manifests/injected_namespaces/namespace-payments.yaml",
                "manifests/webhook_configurations/mutatingwebhookconfiguration.yaml",
                "manifests/webhook_configurations/validatingwebhookconfiguration.yaml",
                "operator-version.txt",
                "support-archive.log",
            ]
        );
    }
}
