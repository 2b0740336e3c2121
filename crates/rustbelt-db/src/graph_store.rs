//! Routing graphs built from `road_nodes` and `road_segments`.

use std::collections::BTreeMap;

use sqlx::PgPool;
use uuid::Uuid;

use rustbelt_types::{GeoPoint, NodeId, RegionId};
use rustbelt_world::RoadGraph;

use crate::error::DbError;

/// Reads routing graphs.
pub struct GraphStore<'a> {
    pool: &'a PgPool,
}

impl<'a> GraphStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// One graph per region that has any nodes.
    ///
    /// Segment cost uses the current health of the road it belongs to;
    /// segments with no road count as fully healthy. A segment whose
    /// endpoints are missing from the graph is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if either query fails.
    pub async fn load_graphs(&self) -> Result<BTreeMap<RegionId, RoadGraph>, DbError> {
        let nodes: Vec<(Uuid, Uuid, f64, f64)> = sqlx::query_as("SELECT id, region_id, lon, lat FROM road_nodes")
            .fetch_all(self.pool)
            .await?;
        let segments: Vec<(Uuid, Uuid, Uuid, f64, f64)> = sqlx::query_as(
            r"SELECT s.region_id, s.node_a, s.node_b, s.length_m, COALESCE(fs.health, 100) AS health
              FROM road_segments s
              LEFT JOIN feature_state fs ON fs.feature_id = s.feature_id",
        )
        .fetch_all(self.pool)
        .await?;

        let mut graphs: BTreeMap<RegionId, RoadGraph> = BTreeMap::new();
        for (id, region_id, lon, lat) in nodes {
            graphs
                .entry(RegionId::from(region_id))
                .or_default()
                .add_node(NodeId::from(id), GeoPoint::new(lon, lat));
        }
        for (region_id, a, b, length_m, health) in segments {
            let Some(graph) = graphs.get_mut(&RegionId::from(region_id)) else {
                continue;
            };
            if let Err(e) = graph.add_segment(NodeId::from(a), NodeId::from(b), length_m, health) {
                tracing::debug!(error = %e, "skipping road segment");
            }
        }

        tracing::debug!(regions = graphs.len(), "routing graphs loaded");
        Ok(graphs)
    }
}
