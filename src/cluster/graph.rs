//! Electrode adjacency graph.
//!
//! Built once from an undirected edge list, validated, and immutable from then
//! on. All-pairs shortest-path distances are precomputed (BFS from every
//! node), which is cheap for the few dozen electrodes of a montage.
use std::collections::{BTreeMap, VecDeque};

use crate::error::ConfigError;

/// Centro-parieto-occipital part of the 10-10 system, as a 4-neighbour grid:
///
/// ```text
///  C3   C1   Cz   C2   C4
///  CP3  CP1  CPz  CP2  CP4
///  P3   P1   Pz   P2   P4
///  PO7  PO3  POz  PO4  PO8
///       O1   Oz   O2
/// ```
const DEFAULT_EDGES: &[(&str, &str)] = &[
    // rows
    ("C3", "C1"), ("C1", "Cz"), ("Cz", "C2"), ("C2", "C4"),
    ("CP3", "CP1"), ("CP1", "CPz"), ("CPz", "CP2"), ("CP2", "CP4"),
    ("P3", "P1"), ("P1", "Pz"), ("Pz", "P2"), ("P2", "P4"),
    ("PO7", "PO3"), ("PO3", "POz"), ("POz", "PO4"), ("PO4", "PO8"),
    ("O1", "Oz"), ("Oz", "O2"),
    // columns
    ("C3", "CP3"), ("CP3", "P3"), ("P3", "PO7"),
    ("C1", "CP1"), ("CP1", "P1"), ("P1", "PO3"), ("PO3", "O1"),
    ("Cz", "CPz"), ("CPz", "Pz"), ("Pz", "POz"), ("POz", "Oz"),
    ("C2", "CP2"), ("CP2", "P2"), ("P2", "PO4"), ("PO4", "O2"),
    ("C4", "CP4"), ("CP4", "P4"), ("P4", "PO8"),
];

const DEFAULT_MIDLINE: &[&str] = &["Cz", "CPz", "Pz", "POz", "Oz"];

#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeGraph {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    neighbours: Vec<Vec<usize>>,
    midline: Vec<bool>,
    /// `dist[a][b]`, `None` when unreachable.
    dist: Vec<Vec<Option<usize>>>,
}

impl ElectrodeGraph {
    /// The built-in montage (see [`DEFAULT_EDGES`]).
    pub fn default_montage() -> Self {
        Self::assemble(DEFAULT_EDGES.iter().copied(), DEFAULT_MIDLINE.iter().copied())
    }

    /// Build from labelled edges.
    ///
    /// Rejects self-loops and midline labels that appear in no edge. Edges are
    /// undirected; duplicates are ignored.
    pub fn from_edges(edges: &[[String; 2]], midline: &[String]) -> Result<Self, ConfigError> {
        if edges.is_empty() {
            return Err(ConfigError::invalid("cluster.montage.edges", "no edges"));
        }
        for [a, b] in edges {
            if a == b {
                return Err(ConfigError::invalid(
                    "cluster.montage.edges",
                    format!("self-loop on '{a}'"),
                ));
            }
        }
        for m in midline {
            if !edges.iter().any(|[a, b]| a == m || b == m) {
                return Err(ConfigError::UnknownElectrode {
                    electrode: m.clone(),
                    context: "montage midline".into(),
                });
            }
        }
        Ok(Self::assemble(
            edges.iter().map(|[a, b]| (a.as_str(), b.as_str())),
            midline.iter().map(String::as_str),
        ))
    }

    /// Build from an adjacency list. Every neighbour must itself be listed.
    pub fn from_adjacency(
        adjacency: &[(String, Vec<String>)],
        midline: &[String],
    ) -> Result<Self, ConfigError> {
        let mut edges = vec![];
        for (node, neighbours) in adjacency {
            for n in neighbours {
                if !adjacency.iter().any(|(k, _)| k == n) {
                    return Err(ConfigError::UnknownElectrode {
                        electrode: n.clone(),
                        context: format!("adjacency of '{node}'"),
                    });
                }
                edges.push([node.clone(), n.clone()]);
            }
        }
        Self::from_edges(&edges, midline)
    }

    fn assemble<'e>(
        edges: impl Iterator<Item = (&'e str, &'e str)>,
        midline: impl Iterator<Item = &'e str>,
    ) -> Self {
        let mut names: Vec<String> = vec![];
        let mut index = BTreeMap::new();
        let mut neighbours: Vec<Vec<usize>> = vec![];
        let mut intern = |name: &str, names: &mut Vec<String>, neighbours: &mut Vec<Vec<usize>>| {
            *index.entry(name.to_string()).or_insert_with(|| {
                names.push(name.to_string());
                neighbours.push(vec![]);
                names.len() - 1
            })
        };
        for (a, b) in edges {
            let ia = intern(a, &mut names, &mut neighbours);
            let ib = intern(b, &mut names, &mut neighbours);
            if !neighbours[ia].contains(&ib) {
                neighbours[ia].push(ib);
                neighbours[ib].push(ia);
            }
        }
        let mut is_mid = vec![false; names.len()];
        for m in midline {
            if let Some(&i) = index.get(m) {
                is_mid[i] = true;
            }
        }
        let dist = (0..names.len()).map(|src| bfs(&neighbours, src)).collect();
        Self { names, index, neighbours, midline: is_mid, dist }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, i: usize) -> &str {
        &self.names[i]
    }

    pub fn neighbours(&self, i: usize) -> &[usize] {
        &self.neighbours[i]
    }

    pub fn is_midline(&self, i: usize) -> bool {
        self.midline[i]
    }

    /// Shortest-path length in the full graph.
    pub fn distance(&self, a: usize, b: usize) -> Option<usize> {
        self.dist[a][b]
    }

    /// Whether `members` form one connected component of the induced subgraph.
    pub fn is_connected(&self, members: &[usize]) -> bool {
        let Some(&start) = members.first() else {
            return false;
        };
        let mut seen = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for &n in &self.neighbours[v] {
                if members.contains(&n) && !seen.contains(&n) {
                    seen.push(n);
                    queue.push_back(n);
                }
            }
        }
        seen.len() == members.len()
    }

    /// Largest shortest-path distance between any two members;
    /// `None` if some pair is unreachable.
    pub fn diameter(&self, members: &[usize]) -> Option<usize> {
        let mut max = 0;
        for (k, &a) in members.iter().enumerate() {
            for &b in &members[k + 1..] {
                max = max.max(self.distance(a, b)?);
            }
        }
        Some(max)
    }
}

fn bfs(neighbours: &[Vec<usize>], src: usize) -> Vec<Option<usize>> {
    let mut dist = vec![None; neighbours.len()];
    dist[src] = Some(0);
    let mut queue = VecDeque::from([src]);
    while let Some(v) = queue.pop_front() {
        let d = dist[v].unwrap_or(0);
        for &n in &neighbours[v] {
            if dist[n].is_none() {
                dist[n] = Some(d + 1);
                queue.push_back(n);
            }
        }
    }
    dist
}
