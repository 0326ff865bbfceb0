//! Manifest capture
//!
//! Walks a fixed query plan over everything the operator reads or writes and
//! stores each object as a YAML manifest under a deterministic path. Once at
//! least one object is stored, failing to read the webhook configurations or
//! CRDs aborts the collector: at that point the API is clearly reachable, so
//! those errors are real.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tracing::warn;

use crate::crd::{DynaKube, EdgeConnect};
use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::{
    Error, Result, APP_MANAGED_BY_LABEL, APP_NAME_LABEL, DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME,
    INJECTION_INSTANCE_LABEL, OPERATOR_NAME, WEBHOOK_NAME,
};

/// One group of the query plan: a set of kinds sharing the same filters
pub(crate) struct QueryGroup {
    pub resources: Vec<ApiResource>,
    /// `None` queries cluster-scoped kinds
    pub namespace: Option<String>,
    pub params: ListParams,
}

/// The fixed query plan: injected namespaces, the operator namespace, the
/// operator's own components (by both ownership labels), the CRs, config
/// maps, and recent warning events
pub(crate) fn query_plan(operator_namespace: &str, num_events: u32) -> Vec<QueryGroup> {
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Service};

    let component_kinds = || {
        vec![
            ApiResource::erase::<Deployment>(&()),
            ApiResource::erase::<StatefulSet>(&()),
            ApiResource::erase::<DaemonSet>(&()),
            ApiResource::erase::<ReplicaSet>(&()),
            ApiResource::erase::<Service>(&()),
            ApiResource::erase::<Pod>(&()),
            ApiResource::erase::<Job>(&()),
        ]
    };

    vec![
        // injected namespaces
        QueryGroup {
            resources: vec![ApiResource::erase::<Namespace>(&())],
            namespace: None,
            params: ListParams::default().labels(INJECTION_INSTANCE_LABEL),
        },
        // the operator's own namespace
        QueryGroup {
            resources: vec![ApiResource::erase::<Namespace>(&())],
            namespace: None,
            params: ListParams::default().fields(&format!("metadata.name={operator_namespace}")),
        },
        // operator components by name label
        QueryGroup {
            resources: component_kinds(),
            namespace: Some(operator_namespace.to_string()),
            params: ListParams::default().labels(&format!("{APP_NAME_LABEL}={OPERATOR_NAME}")),
        },
        // operator components by managed-by label
        QueryGroup {
            resources: component_kinds(),
            namespace: Some(operator_namespace.to_string()),
            params: ListParams::default()
                .labels(&format!("{APP_MANAGED_BY_LABEL}={OPERATOR_NAME}")),
        },
        // the custom resources themselves
        QueryGroup {
            resources: vec![
                ApiResource::erase::<DynaKube>(&()),
                ApiResource::erase::<EdgeConnect>(&()),
            ],
            namespace: Some(operator_namespace.to_string()),
            params: ListParams::default(),
        },
        // config maps of the operator namespace
        QueryGroup {
            resources: vec![ApiResource::erase::<ConfigMap>(&())],
            namespace: Some(operator_namespace.to_string()),
            params: ListParams::default(),
        },
        // recent warning events
        QueryGroup {
            resources: vec![ApiResource::erase::<Event>(&())],
            namespace: Some(operator_namespace.to_string()),
            params: ListParams::default().fields("type=Warning").limit(num_events),
        },
    ]
}

/// Bundle path of one captured manifest
pub(crate) fn manifest_path(
    kind: &str,
    name: &str,
    namespace: Option<&str>,
    operator_namespace: &str,
) -> String {
    let kind = kind.to_lowercase();
    match namespace {
        Some(ns) => format!("manifests/{ns}/{kind}/{name}.yaml"),
        None if name == operator_namespace => format!("manifests/{name}/{kind}-{name}.yaml"),
        None => format!("manifests/injected_namespaces/{kind}-{name}.yaml"),
    }
}

/// Bundle path of a webhook configuration
pub(crate) fn webhook_config_path(kind: &str) -> String {
    format!("manifests/webhook_configurations/{}.yaml", kind.to_lowercase())
}

/// Bundle path of a CRD; the short name is the first dot-separated segment
/// of the CRD name (`dynakubes.dynatrace.com` stores as `...-dynakubes.yaml`)
pub(crate) fn crd_path(kind: &str, crd_name: &str) -> String {
    let short_name = crd_name.split('.').next().unwrap_or(crd_name);
    format!("manifests/crds/{}-{short_name}.yaml", kind.to_lowercase())
}

/// Cluster reads the manifest capture needs; a trait seam so the plan can be
/// driven against an in-memory cluster in tests
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Run one query of the plan
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<DynamicObject>>;

    /// Mutating webhook configuration by name, `None` on NotFound
    async fn mutating_webhook_config(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>>;

    /// Validating webhook configuration by name, `None` on NotFound
    async fn validating_webhook_config(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingWebhookConfiguration>>;

    /// CustomResourceDefinition by name, `None` on NotFound
    async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;
}

struct ClusterSource {
    client: Client,
}

#[async_trait]
impl ManifestSource for ClusterSource {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        };
        Ok(api.list(params).await?.items)
    }

    async fn mutating_webhook_config(
        &self,
        name: &str,
    ) -> Result<Option<MutatingWebhookConfiguration>> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn validating_webhook_config(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingWebhookConfiguration>> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// Captures manifests per the query plan
pub struct KubernetesObjectsCollector {
    source: Box<dyn ManifestSource>,
    namespace: String,
    num_events: u32,
}

impl KubernetesObjectsCollector {
    /// Collector over a live cluster
    pub fn new(client: Client, namespace: &str, num_events: u32) -> Self {
        Self::with_source(Box::new(ClusterSource { client }), namespace, num_events)
    }

    /// Collector over an arbitrary source (in-memory cluster in tests)
    pub fn with_source(source: Box<dyn ManifestSource>, namespace: &str, num_events: u32) -> Self {
        Self {
            source,
            namespace: namespace.to_string(),
            num_events,
        }
    }

    async fn run_plan(&self, archive: &SupportArchive) -> Result<usize> {
        let mut stored = 0;

        for group in query_plan(&self.namespace, self.num_events) {
            for resource in &group.resources {
                let list = match self
                    .source
                    .list(resource, group.namespace.as_deref(), &group.params)
                    .await
                {
                    Ok(list) => list,
                    Err(err) => {
                        warn!(kind = %resource.kind, error = %err, "manifest query failed");
                        continue;
                    }
                };

                for object in list {
                    let path = manifest_path(
                        &resource.kind,
                        &object.name_any(),
                        object.namespace().as_deref(),
                        &self.namespace,
                    );
                    archive.add_file(&path, to_yaml(&object)?.as_bytes())?;
                    stored += 1;
                }
            }
        }

        Ok(stored)
    }

    async fn collect_cluster_config(&self, archive: &SupportArchive) -> Result<()> {
        if let Some(config) = self.source.mutating_webhook_config(WEBHOOK_NAME).await? {
            archive.add_file(
                &webhook_config_path(&MutatingWebhookConfiguration::kind(&())),
                to_yaml(&config)?.as_bytes(),
            )?;
        }

        if let Some(config) = self.source.validating_webhook_config(WEBHOOK_NAME).await? {
            archive.add_file(
                &webhook_config_path(&ValidatingWebhookConfiguration::kind(&())),
                to_yaml(&config)?.as_bytes(),
            )?;
        }

        for crd_name in [DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME] {
            if let Some(crd) = self.source.crd(crd_name).await? {
                archive.add_file(
                    &crd_path(&CustomResourceDefinition::kind(&()), crd_name),
                    to_yaml(&crd)?.as_bytes(),
                )?;
            }
        }

        Ok(())
    }
}

fn to_yaml<T: Serialize>(object: &T) -> Result<String> {
    serde_yaml::to_string(object).map_err(|err| Error::serialization(err.to_string()))
}

#[async_trait]
impl Collector for KubernetesObjectsCollector {
    fn name(&self) -> &'static str {
        "k8s-objects"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        let stored = self.run_plan(archive).await?;

        if let Err(err) = self.collect_cluster_config(archive).await {
            if stored > 0 {
                return Err(err);
            }
            warn!(error = %err, "cluster configuration unreadable and nothing else stored");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use kube::api::ObjectMeta;

    struct SeededObject {
        kind: String,
        label_selector: Option<String>,
        field_selector: Option<String>,
        object: DynamicObject,
    }

    /// In-memory [`ManifestSource`]; objects answer only the query they were
    /// seeded for
    #[derive(Default)]
    pub(crate) struct FakeManifestSource {
        objects: Vec<SeededObject>,
        pub mutating: Option<MutatingWebhookConfiguration>,
        pub validating: Option<ValidatingWebhookConfiguration>,
        pub crds: Vec<CustomResourceDefinition>,
    }

    impl FakeManifestSource {
        pub fn seed(
            &mut self,
            kind: &str,
            label_selector: Option<&str>,
            field_selector: Option<&str>,
            object: DynamicObject,
        ) {
            self.objects.push(SeededObject {
                kind: kind.to_string(),
                label_selector: label_selector.map(str::to_string),
                field_selector: field_selector.map(str::to_string),
                object,
            });
        }

        pub fn with_webhook_configs(mut self) -> Self {
            self.mutating = Some(MutatingWebhookConfiguration {
                metadata: ObjectMeta {
                    name: Some(WEBHOOK_NAME.into()),
                    ..Default::default()
                },
                ..Default::default()
            });
            self.validating = Some(ValidatingWebhookConfiguration {
                metadata: ObjectMeta {
                    name: Some(WEBHOOK_NAME.into()),
                    ..Default::default()
                },
                ..Default::default()
            });
            self
        }

        pub fn with_crds(mut self) -> Self {
            self.crds = [DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME]
                .iter()
                .map(|name| CustomResourceDefinition {
                    metadata: ObjectMeta {
                        name: Some((*name).into()),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .collect();
            self
        }
    }

    #[async_trait]
    impl ManifestSource for FakeManifestSource {
        async fn list(
            &self,
            resource: &ApiResource,
            _namespace: Option<&str>,
            params: &ListParams,
        ) -> Result<Vec<DynamicObject>> {
            Ok(self
                .objects
                .iter()
                .filter(|seeded| {
                    seeded.kind == resource.kind
                        && seeded.label_selector == params.label_selector
                        && seeded.field_selector == params.field_selector
                })
                .map(|seeded| seeded.object.clone())
                .collect())
        }

        async fn mutating_webhook_config(
            &self,
            _name: &str,
        ) -> Result<Option<MutatingWebhookConfiguration>> {
            Ok(self.mutating.clone())
        }

        async fn validating_webhook_config(
            &self,
            _name: &str,
        ) -> Result<Option<ValidatingWebhookConfiguration>> {
            Ok(self.validating.clone())
        }

        async fn crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
            Ok(self
                .crds
                .iter()
                .find(|crd| crd.name_any() == name)
                .cloned())
        }
    }
}
