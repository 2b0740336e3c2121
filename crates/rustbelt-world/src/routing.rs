//! Road graph routing and travel-time estimation.
//!
//! Shipments and crews move over a graph of connector nodes joined by road
//! segments. A segment's cost is its length inflated by how damaged it is:
//!
//! ```text
//! cost = length_m * (1 + health_penalty * (1 - health / 100))
//! ```
//!
//! Travel time is `cost / speed`, clamped to `[min_travel, max_travel]`.
//! When a region has no graph, or the endpoints are not connected, the
//! estimate falls back to great-circle distance times a detour factor.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use rustbelt_types::{GeoPoint, NodeId, RegionId, Waypoint};

use crate::convert::{floor_i64, round_u64};
use crate::error::WorldError;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Tuning for travel estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelParams {
    /// Meters per second along the route.
    pub speed_mps: f64,
    /// Lower clamp on any trip, in seconds.
    pub min_travel_secs: i64,
    /// Upper clamp on any trip, in seconds.
    pub max_travel_secs: i64,
    /// Straight-line distance multiplier when no route is available.
    pub detour_factor: f64,
    /// How strongly damage inflates segment cost.
    pub health_penalty: f64,
}

impl Default for TravelParams {
    fn default() -> Self {
        Self {
            speed_mps: 12.0,
            min_travel_secs: 10,
            max_travel_secs: 600,
            detour_factor: 1.4,
            health_penalty: 1.0,
        }
    }
}

/// A directed half of a road segment.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    to: NodeId,
    length_m: f64,
    health: f64,
}

/// Connector nodes and the segments between them for one region.
#[derive(Debug, Clone, Default)]
pub struct RoadGraph {
    nodes: BTreeMap<NodeId, GeoPoint>,
    adjacency: BTreeMap<NodeId, Vec<Edge>>,
}

impl RoadGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or move a node.
    pub fn add_node(&mut self, id: NodeId, position: GeoPoint) {
        self.nodes.insert(id, position);
    }

    /// Add a two-way segment between existing nodes.
    pub fn add_segment(&mut self, a: NodeId, b: NodeId, length_m: f64, health: f64) -> Result<(), WorldError> {
        for node in [a, b] {
            if !self.nodes.contains_key(&node) {
                return Err(WorldError::UnknownNode(node));
            }
        }
        let health = health.clamp(0.0, 100.0);
        let length_m = length_m.max(0.0);
        self.adjacency.entry(a).or_default().push(Edge { to: b, length_m, health });
        self.adjacency.entry(b).or_default().push(Edge { to: a, length_m, health });
        Ok(())
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Position of a node.
    pub fn position(&self, id: NodeId) -> Option<GeoPoint> {
        self.nodes.get(&id).copied()
    }

    /// The node closest to `point`.
    pub fn nearest_node(&self, point: GeoPoint) -> Option<NodeId> {
        self.nodes
            .iter()
            .min_by(|(_, a), (_, b)| a.squared_distance(point).total_cmp(&b.squared_distance(point)))
            .map(|(&id, _)| id)
    }

    /// Cheapest path from `start` to `goal` and its weighted length in meters.
    ///
    /// Dijkstra over integer costs (rounded meters) with a `BTreeSet` as the
    /// priority queue.
    pub fn shortest_path(&self, start: NodeId, goal: NodeId, health_penalty: f64) -> Option<(Vec<NodeId>, f64)> {
        if !self.nodes.contains_key(&start) || !self.nodes.contains_key(&goal) {
            return None;
        }
        if start == goal {
            return Some((vec![start], 0.0));
        }

        let mut dist: BTreeMap<NodeId, u64> = BTreeMap::new();
        let mut prev: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut queue: BTreeSet<(u64, NodeId)> = BTreeSet::new();

        dist.insert(start, 0);
        queue.insert((0, start));

        while let Some((current_dist, current)) = queue.pop_first() {
            if current == goal {
                break;
            }
            let Some(edges) = self.adjacency.get(&current) else {
                continue;
            };
            for edge in edges {
                let cost = segment_cost(edge.length_m, edge.health, health_penalty);
                let Some(new_dist) = current_dist.checked_add(cost) else {
                    continue;
                };
                let is_shorter = dist.get(&edge.to).is_none_or(|&existing| new_dist < existing);
                if is_shorter {
                    if let Some(&old_dist) = dist.get(&edge.to) {
                        queue.remove(&(old_dist, edge.to));
                    }
                    dist.insert(edge.to, new_dist);
                    prev.insert(edge.to, current);
                    queue.insert((new_dist, edge.to));
                }
            }
        }

        let total = *dist.get(&goal)?;
        let mut path = VecDeque::new();
        let mut current = goal;
        path.push_front(current);
        while let Some(&predecessor) = prev.get(&current) {
            path.push_front(predecessor);
            current = predecessor;
            if current == start {
                break;
            }
        }
        Some((path.into_iter().collect(), total as f64))
    }

    /// Weighted length of the cheapest single hop `a -> b`, if adjacent.
    fn hop_cost(&self, a: NodeId, b: NodeId, health_penalty: f64) -> Option<u64> {
        self.adjacency
            .get(&a)?
            .iter()
            .filter(|e| e.to == b)
            .map(|e| segment_cost(e.length_m, e.health, health_penalty))
            .min()
    }
}

/// Rounded weighted cost of one segment.
fn segment_cost(length_m: f64, health: f64, health_penalty: f64) -> u64 {
    let damage = 1.0 - health.clamp(0.0, 100.0) / 100.0;
    round_u64(length_m * health_penalty.mul_add(damage, 1.0))
}

/// Looks up the routing graph of a region.
pub trait GraphProvider {
    /// The region's graph, or `None` when no graph data is available.
    fn graph_for(&self, region: RegionId) -> Option<&RoadGraph>;
}

impl GraphProvider for BTreeMap<RegionId, RoadGraph> {
    fn graph_for(&self, region: RegionId) -> Option<&RoadGraph> {
        self.get(&region)
    }
}

/// A provider with no graphs; every estimate uses the fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGraphs;

impl GraphProvider for NoGraphs {
    fn graph_for(&self, _region: RegionId) -> Option<&RoadGraph> {
        None
    }
}

/// Result of estimating one trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TravelEstimate {
    /// Clamped trip duration in whole seconds.
    pub travel_secs: i64,
    /// Weighted (routed) or detoured (fallback) distance in meters.
    pub distance_m: f64,
    /// Whether a graph path was used.
    pub routed: bool,
    /// Path connectors with arrival times; empty for the fallback.
    pub waypoints: Vec<Waypoint>,
}

impl TravelEstimate {
    /// Arrival time for a trip departing at `departed_at`.
    pub fn arrival(&self, departed_at: DateTime<Utc>) -> DateTime<Utc> {
        departed_at + Duration::seconds(self.travel_secs)
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

fn clamp_travel(distance_m: f64, params: &TravelParams) -> i64 {
    let raw = if params.speed_mps > 0.0 {
        floor_i64((distance_m / params.speed_mps).ceil())
    } else {
        params.max_travel_secs
    };
    raw.clamp(params.min_travel_secs, params.max_travel_secs.max(params.min_travel_secs))
}

/// Estimate a trip from `from` to `to`, routing over `graph` when possible.
pub fn estimate_travel(
    graph: Option<&RoadGraph>,
    from: GeoPoint,
    to: GeoPoint,
    departed_at: DateTime<Utc>,
    params: &TravelParams,
) -> TravelEstimate {
    if let Some(estimate) = graph.and_then(|g| route_over(g, from, to, departed_at, params)) {
        return estimate;
    }
    let distance_m = haversine_m(from, to) * params.detour_factor;
    tracing::trace!(distance_m, "no road path, using straight-line estimate");
    TravelEstimate {
        travel_secs: clamp_travel(distance_m, params),
        distance_m,
        routed: false,
        waypoints: Vec::new(),
    }
}

fn route_over(
    graph: &RoadGraph,
    from: GeoPoint,
    to: GeoPoint,
    departed_at: DateTime<Utc>,
    params: &TravelParams,
) -> Option<TravelEstimate> {
    let start = graph.nearest_node(from)?;
    let goal = graph.nearest_node(to)?;
    let (path, distance_m) = graph.shortest_path(start, goal, params.health_penalty)?;
    let travel_secs = clamp_travel(distance_m, params);

    // Spread the clamped duration over the path proportionally to cost.
    let mut waypoints = Vec::with_capacity(path.len());
    let mut covered: u64 = 0;
    let mut previous: Option<NodeId> = None;
    for node in &path {
        if let Some(p) = previous {
            covered = covered.saturating_add(graph.hop_cost(p, *node, params.health_penalty).unwrap_or(0));
        }
        previous = Some(*node);
        let fraction = if distance_m > 0.0 { covered as f64 / distance_m } else { 1.0 };
        let offset = floor_i64(travel_secs as f64 * fraction.clamp(0.0, 1.0) * 1000.0);
        if let Some(position) = graph.position(*node) {
            waypoints.push(Waypoint {
                position,
                arrives_at: departed_at + Duration::milliseconds(offset),
            });
        }
    }

    Some(TravelEstimate {
        travel_secs,
        distance_m,
        routed: true,
        waypoints,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
    }

    /// a --100m-- b --100m-- c, plus a direct a --300m-- c.
    fn line_graph() -> (RoadGraph, NodeId, NodeId, NodeId) {
        let mut g = RoadGraph::new();
        let (a, b, c) = (NodeId::new(), NodeId::new(), NodeId::new());
        g.add_node(a, GeoPoint::new(0.0, 0.0));
        g.add_node(b, GeoPoint::new(0.001, 0.0));
        g.add_node(c, GeoPoint::new(0.002, 0.0));
        assert!(g.add_segment(a, b, 100.0, 100.0).is_ok());
        assert!(g.add_segment(b, c, 100.0, 100.0).is_ok());
        assert!(g.add_segment(a, c, 300.0, 100.0).is_ok());
        (g, a, b, c)
    }

    #[test]
    fn shortest_path_prefers_cheaper_hops() {
        let (g, a, b, c) = line_graph();
        let found = g.shortest_path(a, c, 1.0);
        assert_eq!(found.as_ref().map(|(p, _)| p.clone()), Some(vec![a, b, c]));
        assert!(found.is_some_and(|(_, d)| (d - 200.0).abs() < f64::EPSILON));
    }

    #[test]
    fn damaged_segment_is_avoided() {
        let mut g = RoadGraph::new();
        let (a, b, c) = (NodeId::new(), NodeId::new(), NodeId::new());
        for n in [a, b, c] {
            g.add_node(n, GeoPoint::default());
        }
        // Direct hop at health 0 costs 2 * 150 = 300; detour costs 200.
        assert!(g.add_segment(a, c, 150.0, 0.0).is_ok());
        assert!(g.add_segment(a, b, 100.0, 100.0).is_ok());
        assert!(g.add_segment(b, c, 100.0, 100.0).is_ok());
        assert_eq!(g.shortest_path(a, c, 1.0).map(|(p, _)| p.len()), Some(3));
    }

    #[test]
    fn disconnected_nodes_have_no_path() {
        let mut g = RoadGraph::new();
        let (a, b) = (NodeId::new(), NodeId::new());
        g.add_node(a, GeoPoint::default());
        g.add_node(b, GeoPoint::default());
        assert!(g.shortest_path(a, b, 1.0).is_none());
    }

    #[test]
    fn segment_requires_known_nodes() {
        let mut g = RoadGraph::new();
        let a = NodeId::new();
        g.add_node(a, GeoPoint::default());
        let missing = NodeId::new();
        assert_eq!(g.add_segment(a, missing, 1.0, 100.0), Err(WorldError::UnknownNode(missing)));
    }

    #[test]
    fn routed_estimate_has_monotonic_waypoints() {
        let (g, _, _, _) = line_graph();
        let params = TravelParams {
            speed_mps: 10.0,
            min_travel_secs: 1,
            ..TravelParams::default()
        };
        let est = estimate_travel(Some(&g), GeoPoint::new(0.0, 0.0), GeoPoint::new(0.002, 0.0), t0(), &params);
        assert!(est.routed);
        assert_eq!(est.travel_secs, 20);
        assert_eq!(est.waypoints.len(), 3);
        assert!(est.waypoints.windows(2).all(|w| matches!(w, [x, y] if x.arrives_at <= y.arrives_at)));
        assert_eq!(est.waypoints.last().map(|w| w.arrives_at), Some(est.arrival(t0())));
    }

    #[test]
    fn fallback_uses_detoured_great_circle_and_clamps() {
        let params = TravelParams::default();
        let near = estimate_travel(None, GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.0001), t0(), &params);
        assert!(!near.routed);
        assert!(near.waypoints.is_empty());
        assert_eq!(near.travel_secs, params.min_travel_secs);

        let far = estimate_travel(None, GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0), t0(), &params);
        assert_eq!(far.travel_secs, params.max_travel_secs);
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_m(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));
        assert!((d - 111_195.0).abs() < 100.0);
    }
}
