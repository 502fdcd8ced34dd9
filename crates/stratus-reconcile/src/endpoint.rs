//! API endpoint migration
//!
//! Exactly one node or load balancer advertises the Kubernetes API server at
//! any stable point. When the set of load balancers changes, [`classify`]
//! works out how the advertised address must move and [`resolve`] applies the
//! matching bookkeeping to the working snapshot, returning the old and new
//! address so the caller can rewrite kubeconfigs and certificates.

use thiserror::Error;
use tracing::{debug, info};

use stratus_common::model::{ClusterState, KubernetesCluster, LoadBalancerCluster, NodeType};

/// Errors raised while moving the API endpoint
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The working snapshot has no Kubernetes cluster
    #[error("snapshot has no kubernetes cluster")]
    MissingCluster,

    /// A load balancer named by the change is not in the working snapshot
    #[error("load balancer {0} not found in working snapshot")]
    LoadBalancerNotFound(String),

    /// A load balancer has no materialised DNS endpoint
    #[error("load balancer {0} has no DNS endpoint")]
    MissingDnsEndpoint(String),

    /// No control-plane node can take over the endpoint
    #[error("no control-plane node available to serve the API endpoint")]
    NoControlNode,

    /// The node advertising the endpoint has no public address
    #[error("API endpoint node {0} has no public address")]
    MissingNodeAddress(String),

    /// The move would leave the endpoint where it is
    #[error("API endpoint would stay at {0}")]
    Unchanged(String),
}

/// How the API endpoint must move between two load-balancer sets
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointChange {
    /// Nothing moves
    NoChange,
    /// Same load balancer, different DNS name
    EndpointRenamed {
        /// Load balancer being renamed
        load_balancer: String,
    },
    /// A new load balancer takes the endpoint from the control node
    AttachingLoadBalancer {
        /// Incoming load balancer
        load_balancer: String,
    },
    /// The API load balancer goes away; a control node takes over
    DetachingLoadBalancer {
        /// Outgoing load balancer
        load_balancer: String,
    },
    /// The endpoint moves from one load balancer to another
    MoveEndpoint {
        /// Load balancer losing the endpoint
        from: String,
        /// Load balancer gaining the endpoint
        to: String,
    },
    /// An existing load balancer gains the API server role
    RoleChangedToApiServer {
        /// Load balancer gaining the role
        load_balancer: String,
    },
    /// An existing load balancer loses the API server role
    RoleChangedFromApiServer {
        /// Load balancer losing the role
        load_balancer: String,
    },
}

/// Old and new API server address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointMove {
    /// Address clients used so far
    pub old: String,
    /// Address clients must use from now on
    pub new: String,
}

impl EndpointMove {
    fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Decide how the endpoint moves from `current` to `desired` load balancers
pub fn classify(current: &[LoadBalancerCluster], desired: &[LoadBalancerCluster]) -> EndpointChange {
    let current_api = current.iter().find(|lb| lb.has_api_role());
    let desired_api = desired.iter().find(|lb| lb.has_api_role());

    match (current_api, desired_api) {
        (None, None) => EndpointChange::NoChange,
        (None, Some(incoming)) => {
            let load_balancer = incoming.name().to_string();
            if current.iter().any(|lb| lb.info == incoming.info) {
                EndpointChange::RoleChangedToApiServer { load_balancer }
            } else {
                EndpointChange::AttachingLoadBalancer { load_balancer }
            }
        }
        (Some(outgoing), None) => {
            let load_balancer = outgoing.name().to_string();
            if desired.iter().any(|lb| lb.info == outgoing.info) {
                EndpointChange::RoleChangedFromApiServer { load_balancer }
            } else {
                EndpointChange::DetachingLoadBalancer { load_balancer }
            }
        }
        (Some(outgoing), Some(incoming)) if outgoing.info == incoming.info => {
            if outgoing.dns_name() != incoming.dns_name() {
                EndpointChange::EndpointRenamed {
                    load_balancer: incoming.name().to_string(),
                }
            } else {
                EndpointChange::NoChange
            }
        }
        (Some(outgoing), Some(incoming)) => EndpointChange::MoveEndpoint {
            from: outgoing.name().to_string(),
            to: incoming.name().to_string(),
        },
    }
}

/// Apply `change` to `working` and return the address move it implies.
///
/// `working` holds the Kubernetes cluster and every load balancer that exists
/// while the move happens (outgoing ones included). `current` is the load
/// balancer set before reconciliation and supplies the previous DNS endpoint
/// of a renamed load balancer.
pub fn resolve(
    change: &EndpointChange,
    current: &[LoadBalancerCluster],
    working: &mut ClusterState,
) -> Result<Option<EndpointMove>, EndpointError> {
    let resolved = match change {
        EndpointChange::NoChange => return Ok(None),

        EndpointChange::EndpointRenamed { load_balancer } => {
            let old = current
                .iter()
                .find(|lb| lb.name() == load_balancer)
                .ok_or_else(|| EndpointError::LoadBalancerNotFound(load_balancer.clone()))
                .and_then(dns_endpoint)?;
            let target = find_lb_mut(working, load_balancer)?;
            let new = dns_endpoint(target)?;
            target.used_api_endpoint = true;
            EndpointMove::new(old, new)
        }

        EndpointChange::AttachingLoadBalancer { load_balancer } => {
            let new = dns_endpoint(find_lb(working, load_balancer)?)?;
            let old = demote_endpoint_node(working)?;
            find_lb_mut(working, load_balancer)?.used_api_endpoint = true;
            EndpointMove::new(old, new)
        }

        EndpointChange::DetachingLoadBalancer { load_balancer } => {
            let lb = find_lb_mut(working, load_balancer)?;
            let old = dns_endpoint(lb)?;
            lb.used_api_endpoint = false;
            let new = promote_endpoint_node(working)?;
            EndpointMove::new(old, new)
        }

        EndpointChange::MoveEndpoint { from, to } => {
            let old = dns_endpoint(find_lb(working, from)?)?;
            let new = dns_endpoint(find_lb(working, to)?)?;
            find_lb_mut(working, from)?.used_api_endpoint = false;
            find_lb_mut(working, to)?.used_api_endpoint = true;
            EndpointMove::new(old, new)
        }

        EndpointChange::RoleChangedToApiServer { load_balancer } => {
            let new = dns_endpoint(find_lb(working, load_balancer)?)?;
            let old = match previous_api_lb(working, current, load_balancer) {
                Some(previous) => {
                    let lb = find_lb_mut(working, &previous)?;
                    let old = dns_endpoint(lb)?;
                    lb.used_api_endpoint = false;
                    old
                }
                None => demote_endpoint_node(working)?,
            };
            find_lb_mut(working, load_balancer)?.used_api_endpoint = true;
            EndpointMove::new(old, new)
        }

        EndpointChange::RoleChangedFromApiServer { load_balancer } => {
            let source = previous_api_lb(working, current, "")
                .unwrap_or_else(|| load_balancer.clone());
            let lb = find_lb_mut(working, &source)?;
            let old = dns_endpoint(lb)?;
            lb.used_api_endpoint = false;

            // Another load balancer may still carry the role in the working set.
            let other = working
                .load_balancers
                .iter()
                .find(|lb| lb.has_api_role() && lb.name() != load_balancer && lb.name() != source)
                .map(|lb| lb.name().to_string());
            let new = match other {
                Some(name) => {
                    let lb = find_lb_mut(working, &name)?;
                    let new = dns_endpoint(lb)?;
                    lb.used_api_endpoint = true;
                    new
                }
                None => promote_endpoint_node(working)?,
            };
            EndpointMove::new(old, new)
        }
    };

    if resolved.old == resolved.new {
        return Err(EndpointError::Unchanged(resolved.new));
    }

    info!(
        change = ?change,
        old = %resolved.old,
        new = %resolved.new,
        "resolved API endpoint move"
    );
    Ok(Some(resolved))
}

/// Move the endpoint node out of `leaving_pools` onto a surviving control node.
///
/// Used when the pool holding the endpoint node is removed and no load
/// balancer fronts the API server.
pub fn replace_endpoint_node(
    cluster: &mut KubernetesCluster,
    leaving_pools: &[String],
) -> Result<EndpointMove, EndpointError> {
    let old = {
        let (_, node) = cluster.api_endpoint_node().ok_or(EndpointError::NoControlNode)?;
        address_of(node)?
    };

    let replacement = cluster
        .node_pools
        .iter_mut()
        .filter(|np| np.is_control && !leaving_pools.contains(&np.name))
        .flat_map(|np| np.nodes.iter_mut())
        .next()
        .ok_or(EndpointError::NoControlNode)?;
    let new = address_of(replacement)?;
    replacement.node_type = NodeType::ApiEndpoint;
    let replacement_name = replacement.name.clone();

    for node in cluster
        .node_pools
        .iter_mut()
        .filter(|np| np.is_control)
        .flat_map(|np| np.nodes.iter_mut())
    {
        if node.node_type == NodeType::ApiEndpoint && node.name != replacement_name {
            node.node_type = NodeType::Master;
        }
    }

    debug!(cluster = %cluster.name(), old = %old, new = %new, "replaced API endpoint node");
    Ok(EndpointMove::new(old, new))
}

/// Load balancer that served the endpoint before, other than `excluding`.
///
/// Preference order: the one flagged `used_api_endpoint` in the working set,
/// then any other load balancer that had the API server role.
fn previous_api_lb(
    working: &ClusterState,
    current: &[LoadBalancerCluster],
    excluding: &str,
) -> Option<String> {
    working
        .load_balancers
        .iter()
        .find(|lb| lb.used_api_endpoint && lb.name() != excluding)
        .or_else(|| {
            current
                .iter()
                .find(|lb| lb.has_api_role() && lb.name() != excluding)
        })
        .map(|lb| lb.name().to_string())
}

fn find_lb<'a>(
    working: &'a ClusterState,
    name: &str,
) -> Result<&'a LoadBalancerCluster, EndpointError> {
    working
        .load_balancers
        .iter()
        .find(|lb| lb.name() == name)
        .ok_or_else(|| EndpointError::LoadBalancerNotFound(name.to_string()))
}

fn find_lb_mut<'a>(
    working: &'a mut ClusterState,
    name: &str,
) -> Result<&'a mut LoadBalancerCluster, EndpointError> {
    working
        .load_balancers
        .iter_mut()
        .find(|lb| lb.name() == name)
        .ok_or_else(|| EndpointError::LoadBalancerNotFound(name.to_string()))
}

fn dns_endpoint(lb: &LoadBalancerCluster) -> Result<String, EndpointError> {
    lb.dns_endpoint()
        .map(str::to_string)
        .ok_or_else(|| EndpointError::MissingDnsEndpoint(lb.name().to_string()))
}

fn address_of(node: &stratus_common::model::Node) -> Result<String, EndpointError> {
    if node.public.is_empty() {
        return Err(EndpointError::MissingNodeAddress(node.name.clone()));
    }
    Ok(node.public.clone())
}

/// Hand the endpoint away from the control plane: the endpoint node becomes a
/// plain master. Returns its address.
fn demote_endpoint_node(working: &mut ClusterState) -> Result<String, EndpointError> {
    let cluster = working
        .kubernetes
        .as_mut()
        .ok_or(EndpointError::MissingCluster)?;
    let node = cluster
        .api_endpoint_node_mut()
        .ok_or(EndpointError::NoControlNode)?;
    let old = address_of(node)?;
    node.node_type = NodeType::Master;
    Ok(old)
}

/// Give the endpoint to the control plane: the existing endpoint node if there
/// is one, otherwise the first control node is promoted. Returns its address.
fn promote_endpoint_node(working: &mut ClusterState) -> Result<String, EndpointError> {
    let cluster = working
        .kubernetes
        .as_mut()
        .ok_or(EndpointError::MissingCluster)?;

    if let Some(node) = cluster.api_endpoint_node_mut() {
        return address_of(node);
    }

    let node = cluster
        .first_control_node_mut()
        .ok_or(EndpointError::NoControlNode)?;
    let new = address_of(node)?;
    node.node_type = NodeType::ApiEndpoint;
    Ok(new)
}
