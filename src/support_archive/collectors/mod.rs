//! Concrete collectors of the support-archive pipeline

pub mod fs_logs;
pub mod k8s_objects;
pub mod load_sim;
pub mod logs;
pub mod output;
pub mod troubleshoot;
pub mod version;
