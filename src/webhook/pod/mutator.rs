//! The mutator seam of the pod webhook
//!
//! Each injection feature is one [`PodMutator`]; the webhook runs them
//! sequentially in registration order, both for the initial invocation and
//! for reinvocations.

use super::mutation_request::MutationRequest;
use crate::Result;

/// One injection feature applied to admitted pods.
///
/// `mutate` runs on the initial admission call; `reinvoke` runs when the API
/// server calls the webhook again after a later webhook added containers, and
/// must only touch containers the first pass never saw.
pub trait PodMutator: Send + Sync {
    /// Stable name used in logs and the skip-reason annotation
    fn name(&self) -> &'static str;

    /// Whether this mutator applies to the request at all
    fn is_enabled(&self, request: &MutationRequest) -> bool;

    /// Whether this mutator's marks are already on the pod
    fn is_injected(&self, request: &MutationRequest) -> bool;

    /// Perform the injection on the pod and the shared install container
    fn mutate(&self, request: &mut MutationRequest) -> Result<()>;

    /// Cover containers added since the initial invocation; returns whether
    /// anything was changed
    fn reinvoke(&self, request: &mut MutationRequest) -> bool;
}
