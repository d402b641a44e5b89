//! Pattern graph model — nodes, ports, parameters, and wires as the editor
//! exports them, plus the ingested [`Graph`] the evaluator walks.
//!
//! Node behavior is resolved once, at ingest, from the node title into a
//! closed [`NodeKind`]. Evaluation never inspects titles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::color::Rgb8;

// ── Editor document types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Scalar,
    Field,
    Color,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
}

/// A parameter value: number, string, or bool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(s) => s.trim().parse().ok(),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeParameter {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Editor control kind: slider, select, number, toggle.
    #[serde(rename = "type", default)]
    pub kind: String,
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Layout position. Irrelevant to evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    #[serde(default)]
    pub parameters: Vec<NodeParameter>,
    #[serde(default)]
    pub position: Position,
}

impl NodeData {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
            position: Position::default(),
        }
    }

    pub fn with_input(mut self, id: &str, port_type: PortType) -> Self {
        self.inputs.push(Port {
            id: id.to_string(),
            label: id.to_string(),
            port_type,
        });
        self
    }

    pub fn with_output(mut self, id: &str, port_type: PortType) -> Self {
        self.outputs.push(Port {
            id: id.to_string(),
            label: id.to_string(),
            port_type,
        });
        self
    }

    pub fn with_param(mut self, id: &str, value: ParamValue) -> Self {
        self.parameters.push(NodeParameter {
            id: id.to_string(),
            label: id.to_string(),
            kind: String::new(),
            value,
            min: None,
            max: None,
            step: None,
            options: None,
        });
        self
    }

    pub fn param(&self, id: &str) -> Option<&ParamValue> {
        self.parameters.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    /// First of `ids` present as a number, else `default`.
    pub fn number(&self, ids: &[&str], default: f64) -> f64 {
        ids.iter()
            .find_map(|id| self.param(id).and_then(ParamValue::as_f64))
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    pub fn text(&self, id: &str) -> Option<&str> {
        self.param(id).and_then(ParamValue::as_str)
    }

    /// Hex color parameter; malformed or missing values fall back.
    pub fn color(&self, id: &str, default: Rgb8) -> Rgb8 {
        self.text(id)
            .and_then(|s| Rgb8::from_hex(s).ok())
            .unwrap_or(default)
    }
}

/// One end of a wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRef {
    pub node_id: String,
    pub port_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub id: String,
    pub from: PortRef,
    pub to: PortRef,
    #[serde(rename = "type")]
    pub port_type: PortType,
}

impl Wire {
    pub fn new(id: &str, from: (&str, &str), to: (&str, &str), port_type: PortType) -> Self {
        Self {
            id: id.to_string(),
            from: PortRef {
                node_id: from.0.to_string(),
                port_id: from.1.to_string(),
            },
            to: PortRef {
                node_id: to.0.to_string(),
                port_id: to.1.to_string(),
            },
            port_type,
        }
    }
}

// ── Node kinds ───────────────────────────────────────────────────────────────

/// Evaluation behavior of a node, resolved once from its title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Gradient,
    HueShift,
    Blend,
    Output,
    /// Anything else. Passes its first connected input through.
    Unknown,
}

impl NodeKind {
    pub fn from_title(title: &str) -> Self {
        let t = title.to_ascii_lowercase();
        if t.contains("gradient") {
            NodeKind::Gradient
        } else if t.contains("hue") {
            NodeKind::HueShift
        } else if t.contains("blend") {
            NodeKind::Blend
        } else if t.contains("output") {
            NodeKind::Output
        } else {
            NodeKind::Unknown
        }
    }
}

// ── Ingested graph ───────────────────────────────────────────────────────────

/// A node/wire list with kinds resolved and the reverse-adjacency index built.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<NodeData>,
    kinds: Vec<NodeKind>,
    index: HashMap<String, usize>,
    /// to_node → ordered (to_port, source) pairs
    inputs_of: HashMap<String, Vec<(String, PortRef)>>,
}

impl Graph {
    pub fn new(nodes: Vec<NodeData>, wires: &[Wire]) -> Self {
        let kinds = nodes.iter().map(|n| NodeKind::from_title(&n.title)).collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut inputs_of: HashMap<String, Vec<(String, PortRef)>> = HashMap::new();
        for wire in wires {
            let slots = inputs_of.entry(wire.to.node_id.clone()).or_default();
            // At most one wire per input; the last one supplied wins.
            match slots.iter_mut().find(|(port, _)| *port == wire.to.port_id) {
                Some(slot) => slot.1 = wire.from.clone(),
                None => slots.push((wire.to.port_id.clone(), wire.from.clone())),
            }
        }

        Self {
            nodes,
            kinds,
            index,
            inputs_of,
        }
    }

    pub fn node(&self, id: &str) -> Option<(&NodeData, NodeKind)> {
        self.index.get(id).map(|&i| (&self.nodes[i], self.kinds[i]))
    }

    /// The sink node: first node of kind Output, else the last node.
    pub fn output_node(&self) -> Option<&NodeData> {
        self.kinds
            .iter()
            .position(|k| *k == NodeKind::Output)
            .map(|i| &self.nodes[i])
            .or_else(|| self.nodes.last())
    }

    /// Source feeding `(node_id, port_id)`, if wired.
    pub fn source_of(&self, node_id: &str, port_id: &str) -> Option<&PortRef> {
        self.inputs_of
            .get(node_id)?
            .iter()
            .find(|(port, _)| port == port_id)
            .map(|(_, src)| src)
    }

    /// All wired inputs of a node in wire order.
    pub fn wired_inputs(&self, node_id: &str) -> &[(String, PortRef)] {
        self.inputs_of
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
