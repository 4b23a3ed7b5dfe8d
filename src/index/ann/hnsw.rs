//! Hierarchical Navigable Small World index: a graph-based ANN structure
//! giving logarithmic search with high recall.

use super::{AnnIndex, AnnResult, Vector};
use crate::error::DbError;
use dashmap::DashMap;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, RwLock};

const MAX_LAYERS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Max neighbors per node at layers above 0.
    pub m: usize,
    /// Max neighbors per node at layer 0 (2 * m per the algorithm).
    pub m_max0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Geometric layer-assignment rate, 1 / ln(m).
    pub m_l: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::with_m(16)
    }
}

impl HnswConfig {
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m_max0: m * 2,
            ef_construction: 200,
            ef_search: 50,
            m_l: 1.0 / (m as f64).ln(),
        }
    }

    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }
}

struct Node {
    vector: Vector,
    max_layer: usize,
}

#[derive(Default)]
struct Layer {
    edges: HashMap<String, Vec<String>>,
}

impl Layer {
    fn add_edge(&mut self, from: &str, to: &str) {
        self.edges.entry(from.to_string()).or_default().push(to.to_string());
    }

    fn neighbors(&self, id: &str) -> &[String] {
        self.edges.get(id).map_or(&[], |v| v.as_slice())
    }
}

#[derive(Clone, PartialEq)]
struct Candidate {
    distance: f32,
    id: String,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// A concurrent HNSW index. All vectors share one dimension, fixed by the
/// first vector inserted.
pub struct HnswIndex {
    config: HnswConfig,
    nodes: DashMap<String, Node>,
    layers: Vec<RwLock<Layer>>,
    entry_point: RwLock<Option<String>>,
    max_layer: AtomicUsize,
    rng: Mutex<StdRng>,
    dimension: RwLock<Option<usize>>,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        let mut layers = Vec::with_capacity(MAX_LAYERS);
        for _ in 0..MAX_LAYERS {
            layers.push(RwLock::new(Layer::default()));
        }
        Self {
            config,
            nodes: DashMap::new(),
            layers,
            entry_point: RwLock::new(None),
            max_layer: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
            dimension: RwLock::new(None),
        }
    }

    fn random_layer(&self) -> usize {
        let mut rng = self.rng.lock().unwrap();
        let uniform = Uniform::from(0.0..1.0);
        let mut level = 0;
        while level < MAX_LAYERS - 1 {
            let r: f64 = uniform.sample(&mut *rng);
            if r < (-(level as f64) * self.config.m_l).exp() {
                level += 1;
            } else {
                break;
            }
        }
        level
    }

    fn distance(&self, a: &Vector, b: &Vector) -> f32 {
        a.cosine_similarity(b).map(|s| 1.0 - s).unwrap_or(f32::MAX)
    }

    fn search_layer_greedy(&self, entry: &str, query: &Vector, layer: usize) -> (String, f32) {
        let results = self.search_layer(entry, query, 1, layer);
        results
            .into_iter()
            .next()
            .unwrap_or_else(|| (entry.to_string(), f32::MAX))
    }

    fn search_layer(
        &self,
        entry: &str,
        query: &Vector,
        ef: usize,
        layer: usize,
    ) -> Vec<(String, f32)> {
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut best = BinaryHeap::new();

        let entry_node = match self.nodes.get(entry) {
            Some(n) => n,
            None => return Vec::new(),
        };

        let entry_dist = self.distance(&entry_node.vector, query);
        visited.insert(entry.to_string());
        candidates.push(Candidate {
            distance: entry_dist,
            id: entry.to_string(),
        });
        best.push(Candidate {
            distance: -entry_dist,
            id: entry.to_string(),
        });

        while let Some(curr) = candidates.pop() {
            let worst_best = best.peek().map(|c: &Candidate| -c.distance).unwrap_or(f32::MAX);
            if curr.distance > worst_best {
                break;
            }

            let neighbor_ids: Vec<String> = {
                let layer_guard = self.layers[layer].read().unwrap();
                layer_guard.neighbors(&curr.id).to_vec()
            };

            for neighbor_id in neighbor_ids {
                if visited.contains(&neighbor_id) {
                    continue;
                }
                visited.insert(neighbor_id.clone());

                if let Some(neighbor_node) = self.nodes.get(&neighbor_id) {
                    let dist = self.distance(&neighbor_node.vector, query);
                    let worst_best =
                        best.peek().map(|c: &Candidate| -c.distance).unwrap_or(f32::MAX);
                    if dist < worst_best || best.len() < ef {
                        candidates.push(Candidate {
                            distance: dist,
                            id: neighbor_id.clone(),
                        });
                        best.push(Candidate {
                            distance: -dist,
                            id: neighbor_id,
                        });
                        if best.len() > ef {
                            best.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(String, f32)> = best.into_iter().map(|c| (c.id, -c.distance)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }

    fn prune(&self, layer: usize, node_id: &str) {
        let max_connections = self.max_connections(layer);
        let neighbors: Vec<String> = {
            let layer_guard = self.layers[layer].read().unwrap();
            layer_guard.neighbors(node_id).to_vec()
        };
        if neighbors.len() <= max_connections {
            return;
        }
        let node = match self.nodes.get(node_id) {
            Some(n) => n,
            None => return,
        };
        let mut dists: Vec<(String, f32)> = neighbors
            .iter()
            .filter_map(|nid| {
                self.nodes.get(nid).map(|n| (nid.clone(), self.distance(&node.vector, &n.vector)))
            })
            .collect();
        dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        dists.truncate(max_connections);
        let mut layer_guard = self.layers[layer].write().unwrap();
        layer_guard
            .edges
            .insert(node_id.to_string(), dists.into_iter().map(|(id, _)| id).collect());
    }

    fn add_checked(&self, id: String, vector: Vector) -> Result<(), DbError> {
        {
            let mut dim_guard = self.dimension.write().unwrap();
            match *dim_guard {
                None => *dim_guard = Some(vector.dimension()),
                Some(expected) if expected != vector.dimension() => {
                    return Err(DbError::DimensionMismatch {
                        expected,
                        actual: vector.dimension(),
                    })
                }
                Some(_) => {}
            }
        }

        if self.nodes.contains_key(&id) {
            self.remove_impl(&id);
        }

        let layer = self.random_layer();
        let new_vector = vector.clone();
        self.nodes.insert(id.clone(), Node { vector, max_layer: layer });

        let current_max = self.max_layer.load(AtomicOrdering::Relaxed);
        if layer > current_max || self.entry_point.read().unwrap().is_none() {
            self.max_layer.store(layer, AtomicOrdering::Relaxed);
            *self.entry_point.write().unwrap() = Some(id.clone());
        }

        let entry_point = self.entry_point.read().unwrap().clone();
        if entry_point.as_deref() == Some(id.as_str()) {
            return Ok(());
        }
        let mut curr_ep = entry_point.unwrap();

        let curr_node = self.nodes.get(&curr_ep).unwrap();
        let mut curr_dist = self.distance(&curr_node.vector, &new_vector);
        let curr_max_layer = curr_node.max_layer;
        drop(curr_node);

        for lc in ((layer + 1)..=curr_max_layer).rev() {
            let (new_ep, new_dist) = self.search_layer_greedy(&curr_ep, &new_vector, lc);
            if new_dist < curr_dist {
                curr_ep = new_ep;
                curr_dist = new_dist;
            }
        }

        let min_layer = layer.min(curr_max_layer);
        for lc in (0..=min_layer).rev() {
            let neighbors = self.search_layer(&curr_ep, &new_vector, self.config.ef_construction, lc);
            let m = self.max_connections(lc);
            let selected: Vec<String> = neighbors.into_iter().take(m).map(|(id, _)| id).collect();

            for neighbor_id in &selected {
                {
                    let mut layer_guard = self.layers[lc].write().unwrap();
                    layer_guard.add_edge(&id, neighbor_id);
                    layer_guard.add_edge(neighbor_id, &id);
                }
                self.prune(lc, neighbor_id);
            }
        }

        Ok(())
    }

    fn remove_impl(&self, id: &str) {
        let needs_ep_update = self
            .entry_point
            .read()
            .unwrap()
            .as_deref()
            .map(|ep| ep == id)
            .unwrap_or(false);

        if let Some((_, node)) = self.nodes.remove(id) {
            for layer in 0..=node.max_layer {
                let mut layer_guard = self.layers[layer].write().unwrap();
                layer_guard.edges.remove(id);
                for neighbors in layer_guard.edges.values_mut() {
                    neighbors.retain(|n| n != id);
                }
            }
        }

        if needs_ep_update {
            let mut max_layer = 0;
            let mut new_ep = None;
            for entry in self.nodes.iter() {
                if entry.value().max_layer >= max_layer {
                    max_layer = entry.value().max_layer;
                    new_ep = Some(entry.key().clone());
                }
            }
            *self.entry_point.write().unwrap() = new_ep;
            self.max_layer.store(max_layer, AtomicOrdering::Relaxed);
        }
    }
}

impl AnnIndex for HnswIndex {
    fn add(&self, id: String, vector: Vector) -> Result<(), DbError> {
        self.add_checked(id, vector)
    }

    fn remove(&self, id: &str) {
        self.remove_impl(id);
    }

    fn search(&self, query: &Vector, k: usize) -> Result<Vec<AnnResult>, DbError> {
        if let Some(expected) = *self.dimension.read().unwrap() {
            if expected != query.dimension() {
                return Err(DbError::DimensionMismatch {
                    expected,
                    actual: query.dimension(),
                });
            }
        }
        if self.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let entry_point = match self.entry_point.read().unwrap().clone() {
            Some(ep) => ep,
            None => return Ok(Vec::new()),
        };

        let ef = self.config.ef_search.max(k);
        let max_layer = self.max_layer.load(AtomicOrdering::Relaxed);
        let entry_node = match self.nodes.get(&entry_point) {
            Some(n) => n,
            None => return Ok(Vec::new()),
        };

        let mut curr_ep = entry_point;
        let mut curr_dist = self.distance(&entry_node.vector, query);
        let entry_max_layer = entry_node.max_layer;
        drop(entry_node);

        for lc in (1..=entry_max_layer.min(max_layer)).rev() {
            let (new_ep, new_dist) = self.search_layer_greedy(&curr_ep, query, lc);
            if new_dist < curr_dist {
                curr_ep = new_ep;
                curr_dist = new_dist;
            }
        }

        let candidates = self.search_layer(&curr_ep, query, ef, 0);
        Ok(candidates
            .into_iter()
            .take(k)
            .map(|(id, dist)| AnnResult { id, score: 1.0 - dist })
            .collect())
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn clear(&self) {
        self.nodes.clear();
        for layer in &self.layers {
            layer.write().unwrap().edges.clear();
        }
        *self.entry_point.write().unwrap() = None;
        self.max_layer.store(0, AtomicOrdering::Relaxed);
        *self.dimension.write().unwrap() = None;
    }

    fn dimension(&self) -> Option<usize> {
        *self.dimension.read().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(data: Vec<f32>) -> Vector {
        Vector::new(data)
    }

    #[test]
    fn config_default_sets_m_max0_to_twice_m() {
        let cfg = HnswConfig::default();
        assert_eq!(cfg.m, 16);
        assert_eq!(cfg.m_max0, 32);
    }

    #[test]
    fn add_and_search_returns_closest_first() {
        let index = HnswIndex::new(HnswConfig::default());
        index.add("a".into(), v(vec![1.0, 0.0, 0.0])).unwrap();
        index.add("b".into(), v(vec![0.0, 1.0, 0.0])).unwrap();
        index.add("c".into(), v(vec![0.0, 0.0, 1.0])).unwrap();

        let results = index.search(&v(vec![0.9, 0.1, 0.0]), 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "a");
        for i in 1..results.len() {
            assert!(results[i - 1].score >= results[i].score);
        }
    }

    #[test]
    fn dimension_mismatch_on_insert_is_rejected() {
        let index = HnswIndex::new(HnswConfig::default());
        index.add("a".into(), v(vec![1.0, 0.0])).unwrap();
        let err = index.add("b".into(), v(vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn dimension_mismatch_on_search_is_rejected() {
        let index = HnswIndex::new(HnswConfig::default());
        index.add("a".into(), v(vec![1.0, 0.0])).unwrap();
        let err = index.search(&v(vec![1.0, 0.0, 0.0]), 1).unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));
    }

    #[test]
    fn remove_reelects_entry_point() {
        let index = HnswIndex::new(HnswConfig::default());
        index.add("a".into(), v(vec![1.0, 0.0])).unwrap();
        index.add("b".into(), v(vec![0.0, 1.0])).unwrap();
        index.remove("a");
        assert_eq!(index.len(), 1);
        let results = index.search(&v(vec![0.0, 1.0]), 1).unwrap();
        assert_eq!(results[0].id, "b");
    }

    #[test]
    fn empty_index_search_returns_empty() {
        let index = HnswIndex::new(HnswConfig::default());
        assert!(index.search(&v(vec![1.0, 0.0]), 5).unwrap().is_empty());
    }

    #[test]
    fn recall_over_a_larger_set() {
        let index = HnswIndex::new(HnswConfig::with_m(8));
        for i in 0..200 {
            let angle = i as f32;
            index.add(format!("doc{i}"), v(vec![angle, angle * 2.0])).unwrap();
        }
        let results = index.search(&v(vec![100.0, 200.0]), 5).unwrap();
        assert!(!results.is_empty());
        assert!(results[0].score > 0.99);
    }
}
