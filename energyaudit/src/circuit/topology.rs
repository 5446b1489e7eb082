//! Circuit Topology Graph
//!
//! A petgraph view of how canonical circuits relate to each other:
//! - panels feed their branch loads (`Feeds`)
//! - voltage drop circuits analyse a Schedule of Loads circuit (`Analyses`)
//!
//! The graph answers "what else does this edit touch", so that conflict
//! re-evaluation and recalculation cover the feeder of an edited load and
//! every voltage drop circuit that mirrors it.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::schema::{CircuitSource, CircuitType, UnifiedCircuitData};

/// Edge type in the topology graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyEdge {
    /// Panel feeder -> branch load
    Feeds,
    /// Voltage drop circuit -> Schedule of Loads circuit
    Analyses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub circuit_id: String,
    pub source: CircuitSource,
    pub circuit_type: CircuitType,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitTopology {
    graph: DiGraph<TopologyNode, TopologyEdge>,
    indices: HashMap<String, NodeIndex>,
}

impl CircuitTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a circuit node, returning the existing index if already present
    pub fn add_circuit(&mut self, circuit: &UnifiedCircuitData) -> NodeIndex {
        if let Some(&idx) = self.indices.get(&circuit.id) {
            return idx;
        }
        let idx = self.graph.add_node(TopologyNode {
            circuit_id: circuit.id.clone(),
            source: circuit.source,
            circuit_type: circuit.circuit_type,
        });
        self.indices.insert(circuit.id.clone(), idx);
        idx
    }

    /// Record that `panel_id` feeds `load_id`
    pub fn connect_feeder(&mut self, panel_id: &str, load_id: &str) -> bool {
        self.connect(panel_id, load_id, TopologyEdge::Feeds)
    }

    /// Record that voltage drop circuit `vd_id` analyses `sol_id`
    pub fn link_analysis(&mut self, vd_id: &str, sol_id: &str) -> bool {
        self.connect(vd_id, sol_id, TopologyEdge::Analyses)
    }

    fn connect(&mut self, from: &str, to: &str, edge: TopologyEdge) -> bool {
        let (Some(&a), Some(&b)) = (self.indices.get(from), self.indices.get(to)) else {
            return false;
        };
        if self.graph.edges_connecting(a, b).any(|e| *e.weight() == edge) {
            return true;
        }
        self.graph.add_edge(a, b, edge);
        true
    }

    pub fn contains(&self, circuit_id: &str) -> bool {
        self.indices.contains_key(circuit_id)
    }

    /// Panel feeding a branch circuit
    pub fn feeder_of(&self, circuit_id: &str) -> Option<&str> {
        self.neighbors(circuit_id, Direction::Incoming, TopologyEdge::Feeds)
            .into_iter()
            .next()
    }

    /// Schedule of Loads circuit analysed by a voltage drop circuit
    pub fn counterpart_of(&self, vd_id: &str) -> Option<&str> {
        self.neighbors(vd_id, Direction::Outgoing, TopologyEdge::Analyses)
            .into_iter()
            .next()
    }

    /// Voltage drop circuits analysing a Schedule of Loads circuit
    pub fn analysers_of(&self, sol_id: &str) -> Vec<&str> {
        self.neighbors(sol_id, Direction::Incoming, TopologyEdge::Analyses)
    }

    /// Branch circuits fed by a panel
    pub fn loads_of(&self, panel_id: &str) -> Vec<&str> {
        self.neighbors(panel_id, Direction::Outgoing, TopologyEdge::Feeds)
    }

    fn neighbors(&self, circuit_id: &str, direction: Direction, kind: TopologyEdge) -> Vec<&str> {
        let Some(&idx) = self.indices.get(circuit_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, direction)
            .filter(|e| *e.weight() == kind)
            .filter_map(|e| {
                let other = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph.node_weight(other).map(|n| n.circuit_id.as_str())
            })
            .collect()
    }

    /// Every circuit whose derived values or conflict state may change when
    /// `circuit_id` is edited: the circuit, the feeder above it, and all
    /// circuits linked to either by analysis.
    pub fn affected_by(&self, circuit_id: &str) -> BTreeSet<String> {
        let mut affected = BTreeSet::new();
        if !self.contains(circuit_id) {
            affected.insert(circuit_id.to_string());
            return affected;
        }

        let mut chain = vec![circuit_id.to_string()];
        let mut cursor = circuit_id.to_string();
        while let Some(panel) = self.feeder_of(&cursor) {
            if chain.iter().any(|c| c == panel) {
                break;
            }
            chain.push(panel.to_string());
            cursor = panel.to_string();
        }

        for id in chain {
            if let Some(target) = self.counterpart_of(&id) {
                affected.insert(target.to_string());
            }
            for vd in self.analysers_of(&id) {
                affected.insert(vd.to_string());
            }
            affected.insert(id);
        }
        affected
    }

    pub fn stats(&self) -> TopologyStats {
        let mut stats = TopologyStats::default();
        for node in self.graph.node_weights() {
            match (node.source, node.circuit_type) {
                (CircuitSource::ScheduleOfLoads, CircuitType::Feeder) => stats.panel_count += 1,
                (CircuitSource::ScheduleOfLoads, CircuitType::Branch) => stats.branch_count += 1,
                (CircuitSource::VoltageDrop, _) => stats.voltage_drop_count += 1,
            }
        }
        stats.link_count = self
            .graph
            .edge_weights()
            .filter(|e| **e == TopologyEdge::Analyses)
            .count();
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyStats {
    pub panel_count: usize,
    pub branch_count: usize,
    pub voltage_drop_count: usize,
    pub link_count: usize,
}
