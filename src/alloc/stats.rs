use serde::Serialize;

use crate::alloc::model::Node;

/// Per-node slice of the utilization snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct NodeUsage {
    pub id: i64,
    pub capacity_m: i64,
    pub used_quota: i64,
    pub remaining: i64,
    pub utilization: f64,
}

/// Aggregate utilization snapshot plus the Gini imbalance metric.
#[derive(Clone, Debug, Serialize)]
pub struct UsageStats {
    pub total_capacity: i64,
    pub used_total: i64,
    pub remaining_total: i64,
    pub utilization: f64,
    pub per_node: Vec<NodeUsage>,
    pub imbalance_gini: f64,
}

pub fn usage_from_nodes(nodes: &[Node]) -> UsageStats {
    let total_capacity: i64 = nodes.iter().map(|n| n.capacity_m).sum();
    let used_total: i64 = nodes.iter().map(|n| n.used_quota).sum();
    let remaining_total: i64 = nodes.iter().map(|n| n.remaining()).sum();

    let utilization = if total_capacity > 0 {
        used_total as f64 / total_capacity as f64
    } else {
        0.0
    };

    let per_node = nodes
        .iter()
        .map(|n| NodeUsage {
            id: n.id,
            capacity_m: n.capacity_m,
            used_quota: n.used_quota,
            remaining: n.remaining(),
            utilization: if n.capacity_m > 0 {
                n.used_quota as f64 / n.capacity_m as f64
            } else {
                0.0
            },
        })
        .collect();

    let imbalance_gini = gini(nodes.iter().map(|n| n.used_quota as f64));

    UsageStats {
        total_capacity,
        used_total,
        remaining_total,
        utilization,
        per_node,
        imbalance_gini,
    }
}

/// Gini coefficient over per-node usage: 0 is perfectly balanced, values
/// toward 1 mean usage concentrates on a few nodes.
///
/// Negative inputs are dropped; an empty or all-zero sequence reads as
/// balanced. For the sorted-ascending values `x1..xn` with sum `S` the
/// result is `(2 * sum(i * xi)) / (n * S) - (n + 1) / n`, index 1-based.
pub fn gini(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut vals: Vec<f64> = values.into_iter().filter(|v| *v >= 0.0).collect();
    if vals.is_empty() {
        return 0.0;
    }

    vals.sort_by(|a, b| a.total_cmp(b));
    let n = vals.len() as f64;
    let s: f64 = vals.iter().sum();
    if s == 0.0 {
        return 0.0;
    }

    let weighted: f64 = vals
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();

    (2.0 * weighted) / (n * s) - (n + 1.0) / n
}
