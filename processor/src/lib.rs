pub mod cluster_spec;
pub mod controller;
pub mod enqueuer;
pub mod reconciler;
pub mod restart_policy;
pub mod status;
pub mod work_queue;
