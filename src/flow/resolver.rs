use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::Dfs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::flow::definition::{Edge, FlowDefinition, FlowVersion, NodeDefinition};

pub type FlowStore = Arc<dyn FlowStoreType>;

/// Persistence seam for flow definitions and their version history.
#[async_trait]
pub trait FlowStoreType: Send + Sync {
    /// Validates, stores and snapshots a definition. Republishing an
    /// existing flow bumps its version.
    async fn publish(&self, flow: FlowDefinition) -> Result<FlowVersion, EngineError>;
    async fn get(&self, flow_id: Uuid) -> Option<FlowDefinition>;
    /// Active flows wired to a gateway connection, for trigger matching.
    async fn active_for_connection(&self, connection_id: Uuid) -> Vec<FlowDefinition>;
    async fn versions(&self, flow_id: Uuid) -> Vec<FlowVersion>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<Uuid, FlowDefinition>,
    history: DashMap<Uuid, Vec<FlowVersion>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl FlowStoreType for InMemoryFlowStore {
    async fn publish(&self, mut flow: FlowDefinition) -> Result<FlowVersion, EngineError> {
        flow.validate()?;
        if let Some(previous) = self.flows.get(&flow.id) {
            flow.version = previous.version + 1;
        }
        flow.touch();
        let snapshot = flow.snapshot()?;
        self.history
            .entry(flow.id)
            .or_default()
            .push(snapshot.clone());
        self.flows.insert(flow.id, flow);
        Ok(snapshot)
    }

    async fn get(&self, flow_id: Uuid) -> Option<FlowDefinition> {
        self.flows.get(&flow_id).map(|f| f.clone())
    }

    async fn active_for_connection(&self, connection_id: Uuid) -> Vec<FlowDefinition> {
        self.flows
            .iter()
            .filter(|f| f.is_active && f.connection_id == connection_id)
            .map(|f| f.clone())
            .collect()
    }

    async fn versions(&self, flow_id: Uuid) -> Vec<FlowVersion> {
        self.history
            .get(&flow_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// One resolved outgoing edge of a compiled node.
#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub target: String,
    pub source_handle: Option<String>,
}

impl CompiledEdge {
    pub fn is_else(&self) -> bool {
        self.source_handle.as_deref() == Some(crate::flow::definition::ELSE_HANDLE)
    }
}

/// A validated definition with its graph indexes built once. Cycles are
/// legal (ai free-chat loops, menus re-presenting themselves); the engine's
/// per-advance step cap keeps runaway configurations from spinning.
#[derive(Debug)]
pub struct CompiledFlow {
    definition: FlowDefinition,
    graph: StableDiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    outgoing: HashMap<String, Vec<CompiledEdge>>,
}

impl CompiledFlow {
    pub fn compile(definition: FlowDefinition) -> Result<Self, EngineError> {
        definition.validate()?;

        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        for node in &definition.nodes {
            let idx = graph.add_node(node.node_id.clone());
            index_of.insert(node.node_id.clone(), idx);
        }

        let mut outgoing: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
        for edge in &definition.edges {
            let (Some(&from), Some(&to)) = (
                index_of.get(&edge.source_node_id),
                index_of.get(&edge.target_node_id),
            ) else {
                // validate() already guarantees both endpoints exist
                continue;
            };
            graph.add_edge(from, to, ());
            outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(CompiledEdge {
                    target: edge.target_node_id.clone(),
                    source_handle: edge.source_handle.clone(),
                });
        }

        let compiled = Self {
            definition,
            graph,
            index_of,
            outgoing,
        };
        compiled.report_structure();
        Ok(compiled)
    }

    fn report_structure(&self) {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            debug!(
                flow = %self.definition.id,
                "flow graph is cyclic, step cap bounds each advance"
            );
        }
        if let Ok(start) = self.definition.start_node_id() {
            if let Some(&start_idx) = self.index_of.get(start) {
                let mut reached = 0usize;
                let mut dfs = Dfs::new(&self.graph, start_idx);
                while dfs.next(&self.graph).is_some() {
                    reached += 1;
                }
                let total = self.graph.node_count();
                if reached < total {
                    warn!(
                        flow = %self.definition.id,
                        unreachable = total - reached,
                        "flow has nodes unreachable from start"
                    );
                }
            }
        }
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn id(&self) -> Uuid {
        self.definition.id
    }

    pub fn start_node_id(&self) -> Result<&str, EngineError> {
        self.definition.start_node_id()
    }

    pub fn node(&self, node_id: &str) -> Result<&NodeDefinition, EngineError> {
        self.definition.node(node_id).ok_or_else(|| {
            EngineError::Configuration(format!(
                "flow {} references unknown node `{node_id}`",
                self.definition.id
            ))
        })
    }

    /// Outgoing edges in definition order. Empty for terminal nodes.
    pub fn outgoing(&self, node_id: &str) -> &[CompiledEdge] {
        self.outgoing
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    /// The single default continuation of a node. Zero or multiple
    /// unlabelled edges mean the editor produced a broken graph.
    pub fn follow_default(&self, node_id: &str) -> Result<&str, EngineError> {
        let mut targets = self.outgoing(node_id).iter().filter(|e| !e.is_else());
        match (targets.next(), targets.next()) {
            (Some(edge), None) => Ok(&edge.target),
            (None, _) => Err(EngineError::Configuration(format!(
                "flow {}: node `{node_id}` has no outgoing edge",
                self.definition.id
            ))),
            (Some(_), Some(_)) => Err(EngineError::Configuration(format!(
                "flow {}: node `{node_id}` has multiple outgoing edges",
                self.definition.id
            ))),
        }
    }

    /// Branch edges of a condition node in rule order, plus its else edge.
    pub fn branches(&self, node_id: &str) -> (Vec<&CompiledEdge>, Option<&CompiledEdge>) {
        let mut branch_edges = Vec::new();
        let mut else_edge = None;
        for edge in self.outgoing(node_id) {
            if edge.is_else() {
                else_edge = Some(edge);
            } else {
                branch_edges.push(edge);
            }
        }
        (branch_edges, else_edge)
    }

    /// Target of a menu option edge, 1-based.
    pub fn option_target(&self, node_id: &str, option_index: usize) -> Option<&str> {
        let handle = crate::flow::definition::MenuNode::option_handle(option_index);
        self.outgoing(node_id)
            .iter()
            .find(|e| e.source_handle.as_deref() == Some(handle.as_str()))
            .map(|e| e.target.as_str())
    }

    /// Whether the node loops back onto itself (ai free-chat idiom).
    pub fn has_self_loop(&self, node_id: &str) -> bool {
        self.outgoing(node_id).iter().any(|e| e.target == node_id)
    }

    /// For an ai node with a self loop, the edge that leaves it, if any.
    pub fn non_loop_target(&self, node_id: &str) -> Option<&str> {
        self.outgoing(node_id)
            .iter()
            .find(|e| e.target != node_id && !e.is_else())
            .map(|e| e.target.as_str())
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Compiles flows on demand and caches the result until the next publish.
pub struct FlowResolver {
    store: FlowStore,
    cache: Cache<Uuid, Arc<CompiledFlow>>,
}

impl FlowResolver {
    pub fn new(store: FlowStore) -> Arc<Self> {
        let cache = Cache::builder()
            .max_capacity(1024)
            .time_to_idle(Duration::from_secs(3600))
            .build();
        Arc::new(Self { store, cache })
    }

    pub async fn resolve(&self, flow_id: Uuid) -> Result<Arc<CompiledFlow>, EngineError> {
        if let Some(hit) = self.cache.get(&flow_id).await {
            return Ok(hit);
        }
        let definition = self
            .store
            .get(flow_id)
            .await
            .ok_or(EngineError::FlowNotFound(flow_id))?;
        let compiled = Arc::new(CompiledFlow::compile(definition)?);
        self.cache.insert(flow_id, compiled.clone()).await;
        Ok(compiled)
    }

    /// Publish-through: stores the new definition and drops the stale
    /// compilation so the next advance sees the new version.
    pub async fn publish(&self, flow: FlowDefinition) -> Result<FlowVersion, EngineError> {
        let flow_id = flow.id;
        let version = self.store.publish(flow).await?;
        self.cache.invalidate(&flow_id).await;
        Ok(version)
    }

    pub fn store(&self) -> FlowStore {
        self.store.clone()
    }
}
