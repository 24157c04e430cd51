//! Observed navigation between routes, aggregated into weighted edges.

use std::cmp::Ordering;
use std::collections::HashMap;

use tether_core::Timestamp;

/// Aggregated transitions from one route to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEdge {
    pub from: String,
    pub to: String,
    pub count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// Directed multigraph of route transitions, collapsed to counts.
#[derive(Debug, Default)]
pub struct NavigationGraph {
    edges: HashMap<String, HashMap<String, NavigationEdge>>,
}

impl NavigationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, from: &str, to: &str, now: Timestamp) -> u64 {
        let edge = self
            .edges
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_insert_with(|| NavigationEdge {
                from: from.to_string(),
                to: to.to_string(),
                count: 0,
                first_seen: now,
                last_seen: now,
            });
        edge.count += 1;
        edge.last_seen = now;
        edge.count
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&NavigationEdge> {
        self.edges.get(from).and_then(|targets| targets.get(to))
    }

    /// Edges out of `from`, most traversed first. Ties go to the most
    /// recently seen, then to destination name.
    pub fn ranked_from(&self, from: &str) -> Vec<&NavigationEdge> {
        let mut ranked: Vec<&NavigationEdge> = self
            .edges
            .get(from)
            .map(|targets| targets.values().collect())
            .unwrap_or_default();
        ranked.sort_by(|a, b| rank(a, b));
        ranked
    }

    /// Drop edges last seen before `cutoff`. Returns how many were dropped.
    pub fn prune_before(&mut self, cutoff: Timestamp) -> usize {
        let mut removed = 0;
        for targets in self.edges.values_mut() {
            let before = targets.len();
            targets.retain(|_, edge| edge.last_seen >= cutoff);
            removed += before - targets.len();
        }
        self.edges.retain(|_, targets| !targets.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

fn rank(a: &NavigationEdge, b: &NavigationEdge) -> Ordering {
    b.count
        .cmp(&a.count)
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.to.cmp(&b.to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_record_aggregates() {
        let mut graph = NavigationGraph::new();
        let t0 = Utc::now();
        assert_eq!(graph.record("/home", "/courses", t0), 1);
        assert_eq!(graph.record("/home", "/courses", t0 + Duration::seconds(5)), 2);

        let edge = graph.edge("/home", "/courses").unwrap();
        assert_eq!(edge.first_seen, t0);
        assert_eq!(edge.last_seen, t0 + Duration::seconds(5));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_ranking_by_count_then_recency() {
        let mut graph = NavigationGraph::new();
        let t0 = Utc::now();
        graph.record("/home", "/a", t0);
        graph.record("/home", "/b", t0);
        graph.record("/home", "/b", t0);
        graph.record("/home", "/c", t0 + Duration::seconds(1));

        let order: Vec<&str> = graph
            .ranked_from("/home")
            .into_iter()
            .map(|edge| edge.to.as_str())
            .collect();
        assert_eq!(order, vec!["/b", "/c", "/a"]);
        assert!(graph.ranked_from("/nowhere").is_empty());
    }

    #[test]
    fn test_prune_before() {
        let mut graph = NavigationGraph::new();
        let t0 = Utc::now();
        graph.record("/home", "/old", t0);
        graph.record("/courses", "/old", t0);
        graph.record("/home", "/new", t0 + Duration::days(8));

        assert_eq!(graph.prune_before(t0 + Duration::days(1)), 2);
        assert_eq!(graph.len(), 1);
        assert!(graph.edge("/courses", "/old").is_none());
    }
}
