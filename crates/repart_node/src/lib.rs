//! Host-side pieces for running the repartition controller outside a real
//! cluster: a simulated cluster, a seeded workload, JSON-lines traces and the
//! driver that ties them together.

pub mod driver;
pub mod sim;
pub mod trace;
pub mod workload;
