//! Typed kinds served by the desired-state API.
//!
//! CRD schema generation is disabled on purpose: the schemas are installed out of band,
//! the controller only needs the serde shape.

pub mod cluster;
pub mod dataprotection;
pub mod definition;
pub mod parameters;
pub mod workload;

pub const APPS_GROUP: &str = "apps.trellis.io";
pub const WORKLOADS_GROUP: &str = "workloads.trellis.io";
pub const PARAMETERS_GROUP: &str = "parameters.trellis.io";
pub const DATAPROTECTION_GROUP: &str = "dataprotection.trellis.io";
