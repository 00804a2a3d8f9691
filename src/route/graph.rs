use serde::{Deserialize, Serialize};

use crate::bus::types::BusKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Bus index {0} defined twice")]
    DuplicateBus(usize),
    #[error("Node '{node}' references unknown bus {bus_index}")]
    UnknownBus { node: String, bus_index: usize },
    #[error("Node '{node}' declares a {declared} interface on {actual} bus {bus_index}")]
    KindMismatch {
        node: String,
        bus_index: usize,
        declared: BusKind,
        actual: BusKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub index: usize,
    pub kind: BusKind,
}

/// A node's attachment to one bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub bus_index: usize,
    pub kind: BusKind,
    /// Node forwards traffic arriving on this interface
    #[serde(default)]
    pub routing_capable: bool,
    #[serde(default = "enabled")]
    pub update_enabled: bool,
    #[serde(default = "enabled")]
    pub diagnosis_enabled: bool,
}

fn enabled() -> bool {
    true
}

impl Interface {
    pub fn new(bus_index: usize, kind: BusKind) -> Self {
        Self {
            bus_index,
            kind,
            routing_capable: false,
            update_enabled: true,
            diagnosis_enabled: true,
        }
    }

    pub fn routing(mut self) -> Self {
        self.routing_capable = true;
        self
    }

    pub fn with_update(mut self, enabled: bool) -> Self {
        self.update_enabled = enabled;
        self
    }

    pub fn with_diagnosis(mut self, enabled: bool) -> Self {
        self.diagnosis_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub interfaces: Vec<Interface>,
    /// Node may forward between CAN and Ethernet
    #[serde(default)]
    pub bridge_capable: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, interfaces: Vec<Interface>) -> Self {
        Self {
            name: name.into(),
            interfaces,
            bridge_capable: false,
        }
    }

    pub fn bridging(mut self) -> Self {
        self.bridge_capable = true;
        self
    }
}

/// Immutable topology snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteGraph {
    buses: Vec<Bus>,
    nodes: Vec<Node>,
}

impl RouteGraph {
    pub fn new(buses: Vec<Bus>, nodes: Vec<Node>) -> Result<Self, GraphError> {
        for (i, bus) in buses.iter().enumerate() {
            if buses[..i].iter().any(|b| b.index == bus.index) {
                return Err(GraphError::DuplicateBus(bus.index));
            }
        }
        for node in &nodes {
            for itf in &node.interfaces {
                let bus = buses
                    .iter()
                    .find(|b| b.index == itf.bus_index)
                    .ok_or_else(|| GraphError::UnknownBus {
                        node: node.name.clone(),
                        bus_index: itf.bus_index,
                    })?;
                if bus.kind != itf.kind {
                    return Err(GraphError::KindMismatch {
                        node: node.name.clone(),
                        bus_index: itf.bus_index,
                        declared: itf.kind,
                        actual: bus.kind,
                    });
                }
            }
        }
        Ok(Self { buses, nodes })
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn bus(&self, index: usize) -> Option<&Bus> {
        self.buses.iter().find(|b| b.index == index)
    }
}
