use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use gateway_client::message::MediaPayload;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// Edge handle that marks the fallback branch of a condition node.
pub const ELSE_HANDLE: &str = "else";

/// A published conversational flow: the node palette the visual editor
/// produces, with every payload decoded into its typed form at load time.
/// Raw JSON survives only inside [`FlowVersion`] snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub org_id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    #[serde(default = "FlowDefinition::default_version")]
    pub version: u32,
    pub nodes: Vec<NodeDefinition>,
    /// Insertion order is meaningful: condition branches and menu options
    /// are matched positionally against it.
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
    #[serde(default)]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NodeDefinition {
    pub node_id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// Editor canvas coordinates. Irrelevant to execution, kept for round trips.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The closed node palette. Matching on it is exhaustive, so a new node
/// type fails to compile until every consumer handles it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Message(MessageNode),
    Menu(MenuNode),
    Input(InputNode),
    Condition(ConditionNode),
    Action(ActionNode),
    Transfer(TransferNode),
    AiResponse(AiResponseNode),
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MessageNode {
    /// Handlebars template, rendered per session.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MenuNode {
    pub title: String,
    pub options: Vec<MenuOption>,
    /// Invalid replies tolerated before the session is handed to a human.
    #[serde(default = "MenuNode::default_transfer_after_failures")]
    pub transfer_after_failures: u32,
}

impl MenuNode {
    fn default_transfer_after_failures() -> u32 {
        3
    }

    /// Edge handle carrying option `index` (1-based).
    pub fn option_handle(index: usize) -> String {
        format!("option-{index}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MenuOption {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InputNode {
    /// Session variable the raw reply is stored under.
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConditionNode {
    /// Matched top to bottom; rule `i` routes through the i-th non-else
    /// outgoing edge of the node.
    pub rules: Vec<ConditionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConditionRule {
    pub variable: String,
    pub operator: ConditionOperator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ActionNode {
    pub action: ActionKind,
}

/// Side effects an action node can request. They run before the session
/// persists, so authors must keep them idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    AddTag { tag: String },
    AssignQueue { queue_id: Uuid },
    SetVariable { name: String, value: String },
    Handoff,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TransferNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<Uuid>,
    /// Farewell text sent before the handoff, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AiResponseNode {
    /// Handlebars template for the instruction prefix; the contact's latest
    /// message is appended when the node executes.
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Edge {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn is_else(&self) -> bool {
        self.source_handle.as_deref() == Some(ELSE_HANDLE)
    }
}

/// How an inbound message may start this flow when no session is active.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TriggerConfig {
    pub keyword: String,
    pub match_mode: MatchMode,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "TriggerConfig::default_enabled")]
    pub enabled: bool,
}

impl TriggerConfig {
    fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Contains,
    StartsWith,
}

/// Immutable snapshot written on every publish. Never executed directly;
/// the engine always runs the compiled latest definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowVersion {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub version: u32,
    pub nodes_data: Value,
    pub edges_data: Value,
    pub published_at: DateTime<Utc>,
}

impl FlowDefinition {
    fn default_version() -> u32 {
        1
    }

    pub fn new(org_id: Uuid, connection_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            connection_id,
            name: name.into(),
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
            trigger: None,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn add_node(mut self, node_id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(NodeDefinition {
            node_id: node_id.into(),
            kind,
            position: None,
        });
        self
    }

    pub fn add_edge(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.add_edge_with_handle(source, target, None)
    }

    pub fn add_edge_with_handle(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        source_handle: Option<&str>,
    ) -> Self {
        self.edges.push(Edge {
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: source_handle.map(|h| h.to_string()),
            label: None,
        });
        self
    }

    pub fn with_trigger(mut self, keyword: impl Into<String>, match_mode: MatchMode) -> Self {
        self.trigger = Some(TriggerConfig {
            keyword: keyword.into(),
            match_mode,
            priority: 0,
            enabled: true,
        });
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Outgoing edges of `node_id`, in definition order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == node_id)
            .collect()
    }

    pub fn start_node_id(&self) -> Result<&str, EngineError> {
        let mut starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start));
        match (starts.next(), starts.next()) {
            (Some(node), None) => Ok(&node.node_id),
            (None, _) => Err(EngineError::Configuration(format!(
                "flow {} has no start node",
                self.id
            ))),
            (Some(_), Some(_)) => Err(EngineError::Configuration(format!(
                "flow {} has more than one start node",
                self.id
            ))),
        }
    }

    /// Structural checks the engine relies on at runtime. Everything caught
    /// here is a configuration error of the flow, not of the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "flow {}: duplicate node id `{}`",
                    self.id, node.node_id
                )));
            }
        }

        let start_id = self.start_node_id()?;
        if self.outgoing(start_id).len() != 1 {
            return Err(EngineError::Configuration(format!(
                "flow {}: start node must have exactly one outgoing edge",
                self.id
            )));
        }

        for edge in &self.edges {
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "flow {}: edge references unknown node `{endpoint}`",
                        self.id
                    )));
                }
            }
        }

        for node in &self.nodes {
            match &node.kind {
                NodeKind::Condition(cond) => self.validate_condition(node, cond)?,
                NodeKind::Menu(menu) => self.validate_menu(node, menu)?,
                _ => {}
            }
        }

        Ok(())
    }

    fn validate_condition(
        &self,
        node: &NodeDefinition,
        cond: &ConditionNode,
    ) -> Result<(), EngineError> {
        let outgoing = self.outgoing(&node.node_id);
        let else_count = outgoing.iter().filter(|e| e.is_else()).count();
        if else_count != 1 {
            return Err(EngineError::Configuration(format!(
                "flow {}: condition `{}` needs exactly one else edge",
                self.id, node.node_id
            )));
        }
        let branch_count = outgoing.len() - else_count;
        if branch_count != cond.rules.len() {
            return Err(EngineError::Configuration(format!(
                "flow {}: condition `{}` has {} rules but {} branch edges",
                self.id,
                node.node_id,
                cond.rules.len(),
                branch_count
            )));
        }
        Ok(())
    }

    fn validate_menu(&self, node: &NodeDefinition, menu: &MenuNode) -> Result<(), EngineError> {
        if menu.options.is_empty() {
            return Err(EngineError::Configuration(format!(
                "flow {}: menu `{}` has no options",
                self.id, node.node_id
            )));
        }
        let handles: HashMap<&str, &Edge> = self
            .outgoing(&node.node_id)
            .into_iter()
            .filter_map(|e| e.source_handle.as_deref().map(|h| (h, e)))
            .collect();
        for index in 1..=menu.options.len() {
            let handle = MenuNode::option_handle(index);
            if !handles.contains_key(handle.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "flow {}: menu `{}` is missing the edge for `{handle}`",
                    self.id, node.node_id
                )));
            }
        }
        Ok(())
    }

    /// Snapshot for the version history, taken on publish.
    pub fn snapshot(&self) -> Result<FlowVersion, EngineError> {
        let nodes_data = serde_json::to_value(&self.nodes)
            .map_err(|e| EngineError::Configuration(format!("unserializable nodes: {e}")))?;
        let edges_data = serde_json::to_value(&self.edges)
            .map_err(|e| EngineError::Configuration(format!("unserializable edges: {e}")))?;
        Ok(FlowVersion {
            id: Uuid::new_v4(),
            flow_id: self.id,
            version: self.version,
            nodes_data,
            edges_data,
            published_at: Utc::now(),
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
