//! Reconciliation planning for Stratus clusters
//!
//! Pure functions over cluster snapshots:
//! - [`diff`] - sequences node pool growth before shrinkage
//! - [`endpoint`] - moves the API server address between nodes and load balancers

#![deny(missing_docs)]

pub mod diff;
pub mod endpoint;

pub use diff::{diff, IntermediateRepresentation};
pub use endpoint::{
    classify, replace_endpoint_node, resolve, EndpointChange, EndpointError, EndpointMove,
};
