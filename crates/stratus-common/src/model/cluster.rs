//! Cluster topology types: clusters, node pools and nodes

use serde::{Deserialize, Serialize};

/// Identity shared by every cluster kind
///
/// Two snapshots describe the same cluster only when both name and hash match;
/// the hash distinguishes a recreated cluster from its predecessor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// User-facing cluster name
    pub name: String,
    /// Random suffix assigned at creation
    pub hash: String,
}

impl ClusterInfo {
    /// Create a cluster identity
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }

    /// Canonical `<name>-<hash>` identifier used for working directories and logs
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.hash)
    }
}

/// Role a node plays inside a Kubernetes cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    /// Control-plane node
    Master,
    /// Control-plane node currently advertised as the API server address
    ApiEndpoint,
    /// Workload node
    #[default]
    Worker,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::ApiEndpoint => write!(f, "apiEndpoint"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A single machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name
    pub name: String,
    /// Publicly reachable address
    #[serde(default)]
    pub public: String,
    /// Address inside the VPN mesh
    #[serde(default)]
    pub private: String,
    /// Node role
    #[serde(default)]
    pub node_type: NodeType,
}

impl Node {
    /// Create a node with the given name, public address and role
    pub fn new(name: impl Into<String>, public: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            public: public.into(),
            private: String::new(),
            node_type,
        }
    }
}

/// How a node pool obtains its machines
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodePoolKind {
    /// Cloud-provisioned pool sized by count
    #[serde(rename_all = "camelCase")]
    Dynamic {
        /// Desired number of machines
        count: u32,
        /// Provider name (e.g. "hetzner", "aws")
        provider: String,
        /// Provider-specific machine type
        #[serde(default)]
        server_type: String,
        /// Provider region
        #[serde(default)]
        region: String,
    },
    /// Pre-existing machines listed explicitly in `NodePool::nodes`
    Static,
}

/// Named group of identically provisioned nodes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name, unique within its cluster
    pub name: String,
    /// Provisioning variant
    pub kind: NodePoolKind,
    /// Whether this pool hosts the control plane
    #[serde(default)]
    pub is_control: bool,
    /// Nodes currently belonging to the pool
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl NodePool {
    /// Create a dynamic pool with `count` machines and no nodes materialised yet
    pub fn dynamic(name: impl Into<String>, provider: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            kind: NodePoolKind::Dynamic {
                count,
                provider: provider.into(),
                server_type: String::new(),
                region: String::new(),
            },
            is_control: false,
            nodes: Vec::new(),
        }
    }

    /// Create a static pool from an explicit node list
    pub fn static_pool(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            kind: NodePoolKind::Static,
            is_control: false,
            nodes,
        }
    }

    /// Mark this pool as a control-plane pool
    pub fn control(mut self) -> Self {
        self.is_control = true;
        self
    }

    /// Attach nodes to the pool
    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Number of machines the pool describes
    ///
    /// Dynamic pools report their configured count, static pools the length of
    /// their node list.
    pub fn count(&self) -> u32 {
        match &self.kind {
            NodePoolKind::Dynamic { count, .. } => *count,
            NodePoolKind::Static => self.nodes.len() as u32,
        }
    }

    /// Whether any node of this pool carries the API endpoint
    pub fn has_api_endpoint(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.node_type == NodeType::ApiEndpoint)
    }
}

/// Kubernetes cluster snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCluster {
    /// Cluster identity
    pub info: ClusterInfo,
    /// Private network CIDR of the VPN mesh
    #[serde(default)]
    pub network: String,
    /// Admin kubeconfig, populated after bootstrap
    #[serde(default)]
    pub kubeconfig: String,
    /// Kubernetes version
    #[serde(default)]
    pub version: String,
    /// Ordered node pools
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

impl KubernetesCluster {
    /// Create an empty cluster with the given identity
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            info: ClusterInfo::new(name, hash),
            ..Default::default()
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Look up a node pool by name
    pub fn node_pool(&self, name: &str) -> Option<&NodePool> {
        self.node_pools.iter().find(|np| np.name == name)
    }

    /// Look up a node pool by name, mutably
    pub fn node_pool_mut(&mut self, name: &str) -> Option<&mut NodePool> {
        self.node_pools.iter_mut().find(|np| np.name == name)
    }

    /// Control-plane node pools in declaration order
    pub fn control_pools(&self) -> impl Iterator<Item = &NodePool> {
        self.node_pools.iter().filter(|np| np.is_control)
    }

    /// The node currently advertised as the API server, with its pool name
    pub fn api_endpoint_node(&self) -> Option<(&str, &Node)> {
        self.control_pools().find_map(|np| {
            np.nodes
                .iter()
                .find(|n| n.node_type == NodeType::ApiEndpoint)
                .map(|n| (np.name.as_str(), n))
        })
    }

    /// Mutable access to the API endpoint node
    pub fn api_endpoint_node_mut(&mut self) -> Option<&mut Node> {
        self.node_pools
            .iter_mut()
            .filter(|np| np.is_control)
            .flat_map(|np| np.nodes.iter_mut())
            .find(|n| n.node_type == NodeType::ApiEndpoint)
    }

    /// Mutable access to the first node of the first control-plane pool
    pub fn first_control_node_mut(&mut self) -> Option<&mut Node> {
        self.node_pools
            .iter_mut()
            .filter(|np| np.is_control)
            .flat_map(|np| np.nodes.iter_mut())
            .next()
    }
}

/// Kind of traffic a load-balancer role forwards
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoleType {
    /// Kubernetes API server traffic
    ApiServer,
    /// Application ingress traffic
    Ingress,
}

/// Forwarding rule of a load balancer
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Role name
    pub name: String,
    /// Transport protocol ("tcp" or "udp")
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Listening port on the load balancer
    pub port: u16,
    /// Port on the target nodes
    pub target_port: u16,
    /// Names of the target node pools
    #[serde(default)]
    pub target_pools: Vec<String>,
    /// Traffic kind
    pub role_type: RoleType,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl Role {
    /// Standard API server role forwarding 6443 to the control plane
    pub fn api_server(target_pools: Vec<String>) -> Self {
        Self {
            name: "api-server".to_string(),
            protocol: default_protocol(),
            port: 6443,
            target_port: 6443,
            target_pools,
            role_type: RoleType::ApiServer,
        }
    }
}

/// DNS record that fronts a load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    /// Managed zone
    pub dns_zone: String,
    /// Record name inside the zone
    #[serde(default)]
    pub hostname: String,
    /// Fully-qualified endpoint, filled in once the record exists
    #[serde(default)]
    pub endpoint: String,
}

/// Load balancer cluster attached to a Kubernetes cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerCluster {
    /// Load balancer identity
    pub info: ClusterInfo,
    /// Name of the Kubernetes cluster this load balancer fronts
    pub target_cluster: String,
    /// Forwarding rules
    #[serde(default)]
    pub roles: Vec<Role>,
    /// DNS record, if one has been requested
    #[serde(default)]
    pub dns: Option<Dns>,
    /// Whether this load balancer currently serves the API endpoint
    #[serde(default)]
    pub used_api_endpoint: bool,
    /// Machines running the load balancer
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

impl LoadBalancerCluster {
    /// Create a load balancer for `target_cluster`
    pub fn new(
        name: impl Into<String>,
        hash: impl Into<String>,
        target_cluster: impl Into<String>,
    ) -> Self {
        Self {
            info: ClusterInfo::new(name, hash),
            target_cluster: target_cluster.into(),
            ..Default::default()
        }
    }

    /// Load balancer name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether any role forwards API server traffic
    pub fn has_api_role(&self) -> bool {
        self.roles.iter().any(|r| r.role_type == RoleType::ApiServer)
    }

    /// Requested DNS record as zone and hostname, whether or not it exists yet
    pub fn dns_name(&self) -> Option<(&str, &str)> {
        self.dns
            .as_ref()
            .map(|d| (d.dns_zone.as_str(), d.hostname.as_str()))
    }

    /// Fully-qualified DNS endpoint, if the record has been materialised
    pub fn dns_endpoint(&self) -> Option<&str> {
        self.dns
            .as_ref()
            .map(|d| d.endpoint.as_str())
            .filter(|e| !e.is_empty())
    }
}

/// Snapshot of a Kubernetes cluster together with its load balancers
///
/// This is the unit exchanged with every downstream stage.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Kubernetes cluster, absent before creation or after deletion
    #[serde(default)]
    pub kubernetes: Option<KubernetesCluster>,
    /// Load balancers targeting the cluster
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerCluster>,
}

impl ClusterState {
    /// Build a snapshot from its parts
    pub fn new(
        kubernetes: Option<KubernetesCluster>,
        load_balancers: Vec<LoadBalancerCluster>,
    ) -> Self {
        Self {
            kubernetes,
            load_balancers,
        }
    }

    /// Whether the snapshot carries nothing
    pub fn is_empty(&self) -> bool {
        self.kubernetes.is_none() && self.load_balancers.is_empty()
    }

    /// The load balancer serving API traffic, if any
    pub fn api_load_balancer(&self) -> Option<&LoadBalancerCluster> {
        self.load_balancers.iter().find(|lb| lb.has_api_role())
    }
}
