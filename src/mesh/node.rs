use super::space::Point;
#[cfg(feature = "json_export")]
use json::{array, object, JsonValue};
use std::fmt;

/// Handle to a [`Node`] in a [`NodePool`]. Handles are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A vertex of the Mesh in Real Space.
/// Nodes are shared by every `Elem` that references their [`NodeId`]
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub coords: Point,
    pub owner_id: u32,
}

impl Node {
    pub fn new(id: NodeId, coords: Point, owner_id: u32) -> Self {
        Self {
            id,
            coords,
            owner_id,
        }
    }

    /// Produce a Json Object that describes this Node
    #[cfg(feature = "json_export")]
    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id.0,
            "coords": array![self.coords.x, self.coords.y, self.coords.z],
            "owner": self.owner_id,
        }
    }
}

/// Owner of all [`Node`]s in a Mesh
///
/// Nodes are deduplicated on request: [`NodePool::get_or_create`] hands back an existing Node if one lies within a tolerance of the requested position.
/// The search goes through an index of the Nodes sorted by their x-coordinate, so only the slab `[x - tol, x + tol]` is inspected.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<Option<Node>>,
    // sorted by (x, id)
    x_index: Vec<(f64, NodeId)>,
    n_live: usize,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new Node without looking for coincident Nodes
    pub fn add(&mut self, coords: Point, owner_id: u32) -> NodeId {
        assert!(
            coords.coords.iter().all(|c| c.is_finite()),
            "Node coordinates must be finite; cannot add Node at {}",
            coords
        );

        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node::new(id, coords, owner_id)));
        self.index_insert(coords.x, id);
        self.n_live += 1;
        id
    }

    /// Find a Node within `tolerance` of `coords`, or create a new one there
    ///
    /// When several Nodes are within `tolerance`, the oldest one (smallest [`NodeId`]) is returned
    pub fn get_or_create(&mut self, coords: Point, owner_id: u32, tolerance: f64) -> NodeId {
        match self.find(&coords, tolerance) {
            Some(id) => id,
            None => self.add(coords, owner_id),
        }
    }

    /// Find the oldest Node within `tolerance` of `coords`
    pub fn find(&self, coords: &Point, tolerance: f64) -> Option<NodeId> {
        let start = self
            .x_index
            .partition_point(|(x, _)| *x < coords.x - tolerance);

        self.x_index[start..]
            .iter()
            .take_while(|(x, _)| *x <= coords.x + tolerance)
            .map(|(_, id)| *id)
            .filter(|id| (self.coords(*id) - coords).norm() <= tolerance)
            .min()
    }

    /// Get a reference to a Node. Panics if the Node was removed.
    pub fn get(&self, id: NodeId) -> &Node {
        match self.try_get(id) {
            Some(node) => node,
            None => panic!("Node {} does not exist in the NodePool!", id),
        }
    }

    pub fn try_get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn coords(&self, id: NodeId) -> &Point {
        &self.get(id).coords
    }

    /// Move an existing Node
    pub fn set_coords(&mut self, id: NodeId, coords: Point) {
        let old_x = self.coords(id).x;
        self.index_remove(old_x, id);
        self.index_insert(coords.x, id);

        if let Some(Some(node)) = self.nodes.get_mut(id.0) {
            node.coords = coords;
        }
    }

    /// Remove a Node from the pool, returning it if it existed
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0).and_then(|slot| slot.take())?;
        self.index_remove(node.coords.x, id);
        self.n_live -= 1;
        Some(node)
    }

    /// Number of live Nodes
    pub fn len(&self) -> usize {
        self.n_live
    }

    pub fn is_empty(&self) -> bool {
        self.n_live == 0
    }

    /// Upper bound on all [`NodeId`]s handed out so far
    pub fn id_bound(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all live Nodes in order of their ids
    pub fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().flatten()
    }

    fn index_position(&self, x: f64, id: NodeId) -> usize {
        self.x_index
            .partition_point(|(x_i, id_i)| *x_i < x || (*x_i == x && *id_i < id))
    }

    fn index_insert(&mut self, x: f64, id: NodeId) {
        let position = self.index_position(x, id);
        self.x_index.insert(position, (x, id));
    }

    fn index_remove(&mut self, x: f64, id: NodeId) {
        let position = self.index_position(x, id);
        assert_eq!(
            self.x_index.get(position).map(|(_, id_i)| *id_i),
            Some(id),
            "NodePool index is out of sync with Node {}!",
            id
        );
        self.x_index.remove(position);
    }
}
