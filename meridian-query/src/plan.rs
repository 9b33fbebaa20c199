//! The execution plan: an arena of nodes keyed by id.
//!
//! Nodes reference each other exclusively through [`ExecutionNodeId`], so
//! walks over the (cyclic-looking, because of subquery links) graph are
//! plain iterations over id sequences. Dependency edges point leaf→root:
//! a node's `dependencies` are the nodes producing its input.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::ServerId;

/// Arena key of a plan node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionNodeId(pub u64);

impl std::fmt::Display for ExecutionNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shard distribution of a collection: owning server to shard ids.
pub type ShardMap = BTreeMap<ServerId, Vec<String>>;

/// The node kinds relevant to engine instantiation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Singleton,
    EnumerateCollection {
        collection: String,
        shards: ShardMap,
    },
    EnumerateList,
    Calculation,
    Filter,
    Limit {
        offset: u64,
        limit: Option<u64>,
        full_count: bool,
    },
    Sort {
        /// A sort constrained by a following limit; allowed between a
        /// fullCount limit and the plan root.
        constrained: bool,
    },
    SubqueryStart,
    SubqueryEnd,
    Remote,
    Scatter,
    Distribute,
    Gather {
        parallelism: GatherParallelism,
    },
    Async,
    Mutex,
    Return {
        inherit_results: bool,
    },
    Traversal {
        edge_collections: Vec<String>,
        shards: ShardMap,
    },
    ShortestPath {
        edge_collections: Vec<String>,
        shards: ShardMap,
    },
    EnumeratePaths {
        edge_collections: Vec<String>,
        shards: ShardMap,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatherParallelism {
    #[default]
    Undefined,
    Serial,
    Parallel,
}

impl NodeKind {
    /// Graph nodes carry their own collection accesses and need options
    /// prepared before block creation.
    pub fn is_graph_node(&self) -> bool {
        matches!(
            self,
            NodeKind::Traversal { .. } | NodeKind::ShortestPath { .. } | NodeKind::EnumeratePaths { .. }
        )
    }

    /// The shard distribution this node reads, if any.
    pub fn shards(&self) -> Option<&ShardMap> {
        match self {
            NodeKind::EnumerateCollection { shards, .. }
            | NodeKind::Traversal { shards, .. }
            | NodeKind::ShortestPath { shards, .. }
            | NodeKind::EnumeratePaths { shards, .. } => Some(shards),
            _ => None,
        }
    }
}

/// One node of the plan arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: ExecutionNodeId,
    pub kind: NodeKind,
    /// Producers of this node's input, leaf→root.
    pub dependencies: Vec<ExecutionNodeId>,
}

/// The finalized execution plan.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    nodes: Vec<PlanNode>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the given dependencies, returning its id.
    pub fn add_node(&mut self, kind: NodeKind, dependencies: &[ExecutionNodeId]) -> ExecutionNodeId {
        let id = ExecutionNodeId(self.nodes.len() as u64);
        self.nodes.push(PlanNode {
            id,
            kind,
            dependencies: dependencies.to_vec(),
        });
        id
    }

    pub fn node(&self, id: ExecutionNodeId) -> &PlanNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter()
    }

    /// The root: the unique node no other node depends on.
    pub fn root(&self) -> Result<ExecutionNodeId, EngineError> {
        let mut referenced: HashSet<ExecutionNodeId> = HashSet::new();
        for node in &self.nodes {
            referenced.extend(node.dependencies.iter().copied());
        }
        let mut roots = self.nodes.iter().filter(|n| !referenced.contains(&n.id));
        let root = roots
            .next()
            .ok_or_else(|| EngineError::MalformedPlan("plan has no root".into()))?;
        if roots.next().is_some() {
            return Err(EngineError::MalformedPlan("plan has more than one root".into()));
        }
        Ok(root.id)
    }

    /// Depth-first post-order from the root: every node appears after all
    /// of its dependencies (subquery bodies included).
    pub fn walk_post_order(&self) -> Result<Vec<ExecutionNodeId>, EngineError> {
        let root = self.root()?;
        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        // (node, dependencies_done)
        let mut stack = vec![(root, false)];
        while let Some((id, deps_done)) = stack.pop() {
            if visited.contains(&id) {
                continue;
            }
            if deps_done {
                visited.insert(id);
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for dep in self.node(id).dependencies.iter().rev() {
                if !visited.contains(dep) {
                    stack.push((*dep, false));
                }
            }
        }
        Ok(out)
    }

    /// Maintainer check of the fullCount constraints: at most one
    /// fullCount limit; never inside a subquery; nothing limit-like
    /// between it and the root except a constrained sort.
    pub fn check_full_count_constraints(&self) -> Result<(), EngineError> {
        let root = self.root()?;
        let mut seen_full_count = false;
        // (node, subquery_depth, limits_between_root_and_here)
        let mut stack = vec![(root, 0usize, 0usize)];
        let mut visited = HashSet::new();
        while let Some((id, depth, limits_above)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.node(id);
            let mut depth = depth;
            let mut limits_above = limits_above;
            match &node.kind {
                // Walking root→leaf, a subquery region starts at its end
                // marker and closes at its start marker.
                NodeKind::SubqueryEnd => depth += 1,
                NodeKind::SubqueryStart => depth = depth.saturating_sub(1),
                NodeKind::Limit { full_count, .. } => {
                    if *full_count {
                        if seen_full_count {
                            return Err(EngineError::FullCountViolation(
                                "more than one fullCount limit".into(),
                            ));
                        }
                        if depth > 0 {
                            return Err(EngineError::FullCountViolation(
                                "fullCount limit inside a subquery".into(),
                            ));
                        }
                        if limits_above > 0 {
                            return Err(EngineError::FullCountViolation(
                                "another limit between the fullCount limit and the root".into(),
                            ));
                        }
                        seen_full_count = true;
                    }
                    limits_above += 1;
                }
                // A constrained sort is limit-like but explicitly allowed
                // above the fullCount limit.
                NodeKind::Sort { constrained: true } => {}
                _ => {}
            }
            for dep in &node.dependencies {
                stack.push((*dep, depth, limits_above));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(full_count: bool) -> NodeKind {
        NodeKind::Limit {
            offset: 0,
            limit: Some(10),
            full_count,
        }
    }

    /// singleton -> enumerate -> filter -> return
    fn linear_plan() -> ExecutionPlan {
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let enumerate = plan.add_node(NodeKind::EnumerateList, &[singleton]);
        let filter = plan.add_node(NodeKind::Filter, &[enumerate]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[filter]);
        plan
    }

    #[test]
    fn post_order_visits_dependencies_first() {
        let plan = linear_plan();
        let order = plan.walk_post_order().unwrap();
        assert_eq!(order.len(), 4);
        let pos = |id: ExecutionNodeId| order.iter().position(|x| *x == id).unwrap();
        for node in plan.nodes() {
            for dep in &node.dependencies {
                assert!(pos(*dep) < pos(node.id), "dependency after dependent");
            }
        }
        // The root comes last.
        assert_eq!(*order.last().unwrap(), plan.root().unwrap());
    }

    #[test]
    fn root_detection_rejects_forests() {
        let mut plan = ExecutionPlan::new();
        plan.add_node(NodeKind::Singleton, &[]);
        plan.add_node(NodeKind::Singleton, &[]);
        assert!(plan.root().is_err());
    }

    #[test]
    fn single_full_count_limit_passes() {
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let enumerate = plan.add_node(NodeKind::EnumerateList, &[singleton]);
        let lim = plan.add_node(limit(true), &[enumerate]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[lim]);
        plan.check_full_count_constraints().unwrap();
    }

    #[test]
    fn two_full_count_limits_are_rejected() {
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let first = plan.add_node(limit(true), &[singleton]);
        let second = plan.add_node(limit(true), &[first]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[second]);
        let err = plan.check_full_count_constraints().unwrap_err();
        assert!(matches!(err, EngineError::FullCountViolation(_)));
    }

    #[test]
    fn full_count_inside_subquery_is_rejected() {
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let sq_start = plan.add_node(NodeKind::SubqueryStart, &[singleton]);
        let lim = plan.add_node(limit(true), &[sq_start]);
        let sq_end = plan.add_node(NodeKind::SubqueryEnd, &[lim]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[sq_end]);
        let err = plan.check_full_count_constraints().unwrap_err();
        assert!(matches!(err, EngineError::FullCountViolation(_)));
    }

    #[test]
    fn plain_limit_above_full_count_is_rejected_but_constrained_sort_passes() {
        // fullCount limit below a plain limit: rejected.
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let fc = plan.add_node(limit(true), &[singleton]);
        let above = plan.add_node(limit(false), &[fc]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[above]);
        assert!(plan.check_full_count_constraints().is_err());

        // Same shape with a constrained sort instead: fine.
        let mut plan = ExecutionPlan::new();
        let singleton = plan.add_node(NodeKind::Singleton, &[]);
        let fc = plan.add_node(limit(true), &[singleton]);
        let sort = plan.add_node(NodeKind::Sort { constrained: true }, &[fc]);
        plan.add_node(NodeKind::Return { inherit_results: false }, &[sort]);
        plan.check_full_count_constraints().unwrap();
    }
}
