//! Generic typed builders and CRUD for Kubernetes objects
//!
//! - [`builder`] - option-pattern constructors for Secret/ConfigMap/Job/Service
//! - [`query`] - typed Get/Create/Update/CreateOrUpdate with content-hash change detection
//! - [`hash`] - stable content hashing (template-hash annotation, Job names)

pub mod builder;
pub mod hash;
pub mod query;
pub mod selector;
