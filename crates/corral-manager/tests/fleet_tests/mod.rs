//! Fleet scenarios
//!
//! - `ownership`: how replicas split clusters between them, and how the
//!   split moves when a replica leaves
//! - `lifecycle`: a single cluster going from provisioned to deleted

mod helpers;
mod lifecycle;
mod ownership;
