//! Layer-batched graph traversals
//!
//! Every walk expands one BFS layer per round with a single
//! [`relations::for_frontier`] call over the whole frontier, so the number of
//! queries is bounded by depth rather than by graph size. Entity rows for a
//! layer are fetched the same way.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{EdgeView, NodeView};
use crate::error::Result;
use crate::model::{Entity, Relation};
use crate::store::entities;
use crate::store::relations::{self, Direction};

/// Which way a dependency subtree grows from its root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DependencyDirection {
    /// What depends on the root (incoming edges)
    Upstream,
    /// What the root depends on (outgoing edges)
    Downstream,
    #[default]
    Both,
}

impl DependencyDirection {
    fn edges(self) -> Direction {
        match self {
            DependencyDirection::Upstream => Direction::Incoming,
            DependencyDirection::Downstream => Direction::Outgoing,
            DependencyDirection::Both => Direction::Both,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions<'a> {
    pub direction: Direction,
    pub depth: usize,
    pub relation_type: Option<&'a str>,
    pub include_deleted: bool,
}

/// Nodes and edges reached from a root
#[derive(Debug, Clone, Serialize)]
pub struct Subgraph {
    pub root: NodeView,
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub depth_reached: usize,
    /// Queries issued, one per layer
    pub layers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactedEntity {
    #[serde(flatten)]
    pub node: NodeView,
    pub distance: usize,
    /// Keys from the affected entity to the root, following the edges
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub root: NodeView,
    pub depth: usize,
    pub affected: Vec<ImpactedEntity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    pub from: NodeView,
    pub to: NodeView,
    pub found: bool,
    pub path: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub hops: usize,
}

/// Loads entities for node views, one batch per layer
struct NodeCache<'c> {
    conn: &'c Connection,
    nodes: HashMap<i64, Entity>,
}

impl<'c> NodeCache<'c> {
    fn new(conn: &'c Connection, root: &Entity) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(root.id, root.clone());
        Self { conn, nodes }
    }

    fn load(&mut self, ids: impl IntoIterator<Item = i64>) -> Result<()> {
        let missing: Vec<i64> = ids
            .into_iter()
            .filter(|id| !self.nodes.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for entity in entities::find_by_ids(self.conn, &missing)? {
            self.nodes.insert(entity.id, entity);
        }
        Ok(())
    }

    fn view(&self, id: i64) -> Option<NodeView> {
        self.nodes.get(&id).map(NodeView::from)
    }

    fn edge(&self, rel: &Relation) -> Option<EdgeView> {
        let src = self.nodes.get(&rel.src_entity_id)?;
        let dst = self.nodes.get(&rel.dst_entity_id)?;
        Some(EdgeView::new(rel, &src.key, &dst.key))
    }
}

/// The endpoint of `rel` that is not `from`
fn other_end(rel: &Relation, from: i64) -> i64 {
    if rel.src_entity_id == from {
        rel.dst_entity_id
    } else {
        rel.src_entity_id
    }
}

/// Multi-hop relation walk, deduplicated by visited entity id
pub fn walk(conn: &Connection, root: &Entity, opts: WalkOptions<'_>) -> Result<Subgraph> {
    let mut cache = NodeCache::new(conn, root);
    let mut visited: HashSet<i64> = HashSet::from([root.id]);
    let mut seen_edges: HashSet<i64> = HashSet::new();
    let mut order: Vec<i64> = Vec::new();
    let mut edges: Vec<Relation> = Vec::new();
    let mut frontier = vec![root.id];
    let mut depth_reached = 0;
    let mut layers = 0;

    for depth in 1..=opts.depth {
        if frontier.is_empty() {
            break;
        }
        layers += 1;
        let layer = relations::for_frontier(conn, &frontier, opts.direction, opts.include_deleted)?;
        let in_frontier: HashSet<i64> = frontier.iter().copied().collect();
        let mut next = Vec::new();

        for rel in layer {
            if let Some(ty) = opts.relation_type {
                if rel.relation_type != ty {
                    continue;
                }
            }
            let from = if in_frontier.contains(&rel.src_entity_id)
                && matches!(opts.direction, Direction::Outgoing | Direction::Both)
            {
                rel.src_entity_id
            } else {
                rel.dst_entity_id
            };
            let to = other_end(&rel, from);
            if visited.insert(to) {
                next.push(to);
                order.push(to);
            }
            if seen_edges.insert(rel.id) {
                edges.push(rel);
            }
        }

        if !next.is_empty() {
            depth_reached = depth;
        }
        cache.load(next.iter().copied())?;
        frontier = next;
    }

    cache.load(edges.iter().flat_map(|r| [r.src_entity_id, r.dst_entity_id]))?;
    Ok(Subgraph {
        root: NodeView::from(root),
        nodes: order.iter().filter_map(|id| cache.view(*id)).collect(),
        edges: edges.iter().filter_map(|r| cache.edge(r)).collect(),
        depth_reached,
        layers,
    })
}

/// Reverse-dependency BFS: everything that reaches `root` through incoming
/// edges within `depth` hops, with the distance and path of first discovery
pub fn impact_analysis(
    conn: &Connection,
    root: &Entity,
    depth: usize,
    include_deleted: bool,
) -> Result<ImpactReport> {
    let mut cache = NodeCache::new(conn, root);
    // child -> (parent toward root)
    let mut parent: HashMap<i64, i64> = HashMap::new();
    let mut distance: HashMap<i64, usize> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();
    let mut frontier = vec![root.id];

    for layer in 1..=depth {
        if frontier.is_empty() {
            break;
        }
        let incoming = relations::for_frontier(conn, &frontier, Direction::Incoming, include_deleted)?;
        let mut next = Vec::new();
        for rel in incoming {
            let src = rel.src_entity_id;
            if src == root.id || distance.contains_key(&src) {
                continue;
            }
            distance.insert(src, layer);
            parent.insert(src, rel.dst_entity_id);
            order.push(src);
            next.push(src);
        }
        cache.load(next.iter().copied())?;
        frontier = next;
    }

    let affected = order
        .iter()
        .filter_map(|id| {
            let node = cache.view(*id)?;
            let mut path = vec![node.key.clone()];
            let mut cursor = *id;
            while let Some(up) = parent.get(&cursor) {
                path.push(cache.view(*up)?.key);
                cursor = *up;
            }
            Some(ImpactedEntity {
                node,
                distance: distance.get(id).copied().unwrap_or_default(),
                path,
            })
        })
        .collect();

    Ok(ImpactReport {
        root: NodeView::from(root),
        depth,
        affected,
    })
}

/// Dependency subtree from `root`, frontier-batched per layer
pub fn dependency_graph(
    conn: &Connection,
    root: &Entity,
    direction: DependencyDirection,
    depth: usize,
    include_deleted: bool,
) -> Result<Subgraph> {
    walk(
        conn,
        root,
        WalkOptions {
            direction: direction.edges(),
            depth,
            relation_type: None,
            include_deleted,
        },
    )
}

/// Shortest directed relation path from `from` to `to`.
///
/// Bidirectional BFS: the forward frontier follows outgoing edges, the
/// backward frontier follows incoming edges, alternating one layer at a
/// time until they meet or one side runs dry.
pub fn trace_chain(
    conn: &Connection,
    from: &Entity,
    to: &Entity,
    max_depth: usize,
    include_deleted: bool,
) -> Result<TraceResult> {
    let mut cache = NodeCache::new(conn, from);
    cache.nodes.insert(to.id, to.clone());

    if from.id == to.id {
        return Ok(TraceResult {
            from: NodeView::from(from),
            to: NodeView::from(to),
            found: true,
            path: vec![NodeView::from(from)],
            edges: Vec::new(),
            hops: 0,
        });
    }

    // node -> edge that discovered it
    let mut forward: HashMap<i64, Option<Relation>> = HashMap::from([(from.id, None)]);
    let mut backward: HashMap<i64, Option<Relation>> = HashMap::from([(to.id, None)]);
    let mut forward_frontier = vec![from.id];
    let mut backward_frontier = vec![to.id];
    let mut meeting: Option<i64> = None;
    let mut hops_used = 0;

    while hops_used < max_depth && meeting.is_none() {
        if forward_frontier.is_empty() || backward_frontier.is_empty() {
            break;
        }
        // Smaller side first; alternate on ties
        let expand_forward = match forward_frontier.len().cmp(&backward_frontier.len()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => hops_used % 2 == 0,
        };
        hops_used += 1;

        if expand_forward {
            let layer =
                relations::for_frontier(conn, &forward_frontier, Direction::Outgoing, include_deleted)?;
            let mut next = Vec::new();
            for rel in layer {
                let dst = rel.dst_entity_id;
                if forward.contains_key(&dst) {
                    continue;
                }
                forward.insert(dst, Some(rel));
                next.push(dst);
                if backward.contains_key(&dst) {
                    meeting = Some(dst);
                    break;
                }
            }
            forward_frontier = next;
        } else {
            let layer =
                relations::for_frontier(conn, &backward_frontier, Direction::Incoming, include_deleted)?;
            let mut next = Vec::new();
            for rel in layer {
                let src = rel.src_entity_id;
                if backward.contains_key(&src) {
                    continue;
                }
                backward.insert(src, Some(rel));
                next.push(src);
                if forward.contains_key(&src) {
                    meeting = Some(src);
                    break;
                }
            }
            backward_frontier = next;
        }
    }

    let Some(meet) = meeting else {
        return Ok(TraceResult {
            from: NodeView::from(from),
            to: NodeView::from(to),
            found: false,
            path: Vec::new(),
            edges: Vec::new(),
            hops: 0,
        });
    };

    // from .. meet
    let mut chain: Vec<Relation> = Vec::new();
    let mut cursor = meet;
    while let Some(Some(rel)) = forward.get(&cursor) {
        chain.push(rel.clone());
        cursor = rel.src_entity_id;
    }
    chain.reverse();
    // meet .. to
    let mut cursor = meet;
    while let Some(Some(rel)) = backward.get(&cursor) {
        chain.push(rel.clone());
        cursor = rel.dst_entity_id;
    }

    let mut ids = vec![from.id];
    ids.extend(chain.iter().map(|r| r.dst_entity_id));
    cache.load(ids.iter().copied())?;

    Ok(TraceResult {
        from: NodeView::from(from),
        to: NodeView::from(to),
        found: true,
        path: ids.iter().filter_map(|id| cache.view(*id)).collect(),
        edges: chain.iter().filter_map(|r| cache.edge(r)).collect(),
        hops: chain.len(),
    })
}
