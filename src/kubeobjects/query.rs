//! Object query kit
//!
//! Typed CRUD over Kubernetes objects with content-hash change detection.
//! Every desired object gets a template-hash annotation stamped before it is
//! written; reconcile cycles where nothing changed then reduce to a single
//! annotation comparison instead of a deep object diff.
//!
//! The API surface is abstracted behind [`ObjectApi`] so the state machines
//! built on top (installer, webhooks) are testable against an in-memory
//! store without a cluster.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::hash::template_hash;
use crate::{Result, TEMPLATE_HASH_ANNOTATION};

/// Namespace phase signalling deletion in progress
const TERMINATING_PHASE: &str = "Terminating";

/// Minimal API surface the query kit needs from the cluster
#[async_trait]
pub trait ObjectApi<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Fetch one object, `None` on NotFound
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Create the object
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace the object (unconditional update)
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Delete one object; NotFound surfaces as an error the caller may swallow
    async fn delete(&self, namespace: &str, name: &str, background: bool) -> Result<()>;

    /// List objects of this kind across all namespaces with a given name
    async fn list_by_name(&self, name: &str) -> Result<Vec<K>>;

    /// Phase of a namespace, `None` when the namespace does not exist
    async fn namespace_phase(&self, namespace: &str) -> Result<Option<String>>;
}

/// [`ObjectApi`] implementation over a real cluster connection
pub struct ClusterApi<K> {
    client: Client,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<K> ClusterApi<K> {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<K> ObjectApi<K> for ClusterApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str, background: bool) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = if background {
            DeleteParams::background()
        } else {
            DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn list_by_name(&self, name: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("metadata.name=={name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn namespace_phase(&self, namespace: &str) -> Result<Option<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api
            .get_opt(namespace)
            .await?
            .and_then(|ns| ns.status)
            .and_then(|status| status.phase))
    }
}

/// Comparator deciding whether the current object already matches the desired one
pub type IsEqualFn<K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Comparator deciding whether an update requires delete + create
pub type MustRecreateFn<K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// Generic typed CRUD with pluggable comparators
pub struct KubeQuery<K>
where
    K: Send + Sync,
{
    api: Arc<dyn ObjectApi<K>>,
    is_equal: IsEqualFn<K>,
    must_recreate: MustRecreateFn<K>,
}

impl<K> KubeQuery<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + Debug + Send + Sync + 'static,
{
    /// Query kit over a live cluster with hash-based equality and no recreation
    pub fn new(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope> + DeserializeOwned,
    {
        Self::with_api(Arc::new(ClusterApi::new(client)))
    }

    /// Query kit over an arbitrary API (in-memory store in tests)
    pub fn with_api(api: Arc<dyn ObjectApi<K>>) -> Self {
        Self {
            api,
            is_equal: Box::new(template_hashes_match),
            must_recreate: Box::new(|_, _| false),
        }
    }

    /// Replace the comparators
    pub fn with_comparators(
        mut self,
        is_equal: IsEqualFn<K>,
        must_recreate: MustRecreateFn<K>,
    ) -> Self {
        self.is_equal = is_equal;
        self.must_recreate = must_recreate;
        self
    }

    /// Fetch one object, `None` on NotFound
    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api.get(namespace, name).await
    }

    /// Create the object after stamping its template-hash annotation
    pub async fn create(&self, obj: &K) -> Result<K> {
        let mut desired = obj.clone();
        stamp_template_hash(&mut desired)?;
        self.api.create(&desired).await
    }

    /// Unconditional update
    pub async fn update(&self, obj: &K) -> Result<K> {
        self.api.replace(obj).await
    }

    /// Delete one object; NotFound propagates
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api.delete(namespace, name, true).await
    }

    /// Converge the cluster towards `obj`.
    ///
    /// Returns whether anything was written. The sequence is Get before
    /// Create/Update; a racing external creation surfaces as a create
    /// conflict the caller retries on the next reconcile tick.
    pub async fn create_or_update(&self, obj: &K) -> Result<bool> {
        let mut desired = obj.clone();
        stamp_template_hash(&mut desired)?;

        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        let Some(current) = self.api.get(&namespace, &name).await? else {
            self.api.create(&desired).await?;
            debug!(kind = %K::kind(&()), %namespace, %name, "created");
            return Ok(true);
        };

        if (self.must_recreate)(&current, &desired) {
            self.api.delete(&namespace, &name, false).await?;
            self.api.create(&desired).await?;
            debug!(kind = %K::kind(&()), %namespace, %name, "recreated");
            return Ok(true);
        }

        if (self.is_equal)(&current, &desired) {
            return Ok(false);
        }

        // carry the resource version for optimistic concurrency
        desired.meta_mut().resource_version = current.resource_version();
        self.api.replace(&desired).await?;
        debug!(kind = %K::kind(&()), %namespace, %name, "updated");

        Ok(true)
    }

    /// Best-effort parallel delete across namespaces.
    ///
    /// NotFound is swallowed (absence is the goal); the first other error
    /// is returned after all deletes ran.
    pub async fn delete_for_namespaces(&self, name: &str, namespaces: &[String]) -> Result<()> {
        let deletes = namespaces
            .iter()
            .map(|namespace| self.api.delete(namespace, name, true));

        let results = futures::future::join_all(deletes).await;

        for result in results {
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// All objects of this kind named `name`, across every namespace
    pub async fn get_all_from_namespaces(&self, name: &str) -> Result<Vec<K>> {
        self.api.list_by_name(name).await
    }

    /// CreateOrUpdate a copy of `obj` into each namespace, skipping
    /// namespaces already terminating
    pub async fn create_or_update_for_namespaces(
        &self,
        obj: &K,
        namespaces: &[String],
    ) -> Result<()> {
        for namespace in namespaces {
            let phase = self.api.namespace_phase(namespace).await?;
            if phase.as_deref() == Some(TERMINATING_PHASE) {
                debug!(%namespace, "namespace is terminating, skipping");
                continue;
            }

            let mut copy = obj.clone();
            copy.meta_mut().namespace = Some(namespace.clone());
            copy.meta_mut().resource_version = None;
            self.create_or_update(&copy).await?;
        }

        Ok(())
    }
}

/// Stamp the template-hash annotation onto the object
fn stamp_template_hash<K>(obj: &mut K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let hash = template_hash(obj)?;
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash);
    Ok(())
}

/// Default equality: both sides carry the same template hash
fn template_hashes_match<K>(current: &K, desired: &K) -> bool
where
    K: Resource<DynamicType = ()>,
{
    let current_hash = current
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION));
    let desired_hash = desired
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION));

    match (current_hash, desired_hash) {
        (Some(current), Some(desired)) => current == desired,
        _ => false,
    }
}

// =============================================================================
// In-memory API for tests
// =============================================================================
