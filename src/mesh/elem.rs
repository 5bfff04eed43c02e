use super::{
    node::NodeId,
    refinement::{MeshError, RefinementFlag},
    shape::ElemType,
    EXPECTED_NUM_CHILDREN,
};
#[cfg(feature = "json_export")]
use json::{object, JsonValue};
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Handle to an [`Elem`] in a Mesh. Handles are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElemId(pub usize);

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Elem`s are the basic geometric unit of the `Mesh`
///
/// `Elem`s are responsible for keeping track of:
/// * Their `Node`s (shared with their neighbors and, where they coincide, with their parent)
/// * Their neighbors across each side (`None` on the boundary of the domain)
/// * Connections to their parent `Elem` and to their child `Elem`s (if h-refined)
/// * Their geometric (h) and polynomial (p) refinement state
///
/// The numbering of `Node`s and sides, and the layout of the children, is defined by the [`ElemType`]'s [`ElemShape`](super::shape::ElemShape).
///
/// ## Activity
/// An `Elem` is *active* if its refinement flag is neither `Inactive` nor `CoarsenInactive`.
/// A coarsened parent is active again while it still holds its (now inactive) children; those children are *subactive* until the parent is contracted.
#[derive(Debug, Clone)]
pub struct Elem {
    pub id: ElemId,
    pub elem_type: ElemType,
    pub nodes: SmallVec<[NodeId; 8]>,
    pub neighbors: SmallVec<[Option<ElemId>; 6]>,
    pub subdomain_id: u32,
    pub owner_id: u32,
    pub p_level: u8,
    refinement_flag: RefinementFlag,
    p_refinement_flag: RefinementFlag,
    level: u8,
    parent: Option<ElemId>,
    children: Option<SmallVec<[ElemId; EXPECTED_NUM_CHILDREN]>>,
}

impl Elem {
    /// Construct a new root-level Elem
    pub fn new(id: ElemId, elem_type: ElemType, nodes: &[NodeId], subdomain_id: u32) -> Self {
        assert_eq!(
            nodes.len(),
            elem_type.n_nodes(),
            "{} Elems have {} Nodes; cannot construct Elem {} from {} Nodes!",
            elem_type,
            elem_type.n_nodes(),
            id,
            nodes.len()
        );

        Self {
            id,
            elem_type,
            nodes: SmallVec::from_slice(nodes),
            neighbors: smallvec![None; elem_type.n_sides()],
            subdomain_id,
            owner_id: 0,
            p_level: 0,
            refinement_flag: RefinementFlag::DoNothing,
            p_refinement_flag: RefinementFlag::DoNothing,
            level: 0,
            parent: None,
            children: None,
        }
    }

    /// Is this Elem part of the active layer of the Mesh
    pub fn active(&self) -> bool {
        self.refinement_flag.is_active()
    }

    /// Has this `Elem` been h-Refined (and not yet contracted)
    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    /// Ids of this Elem's children. Returns `None` if this Elem has no children.
    pub fn child_ids(&self) -> Option<&[ElemId]> {
        self.children.as_deref()
    }

    /// Id of the Parent Elem if this Elem has a parent
    pub fn parent_id(&self) -> Option<ElemId> {
        self.parent
    }

    /// Number of h-refinements between this Elem and its root-level ancestor
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn refinement_flag(&self) -> RefinementFlag {
        self.refinement_flag
    }

    pub fn p_refinement_flag(&self) -> RefinementFlag {
        self.p_refinement_flag
    }

    /// Does at least one side of this Elem lie on the boundary of the domain
    pub fn is_on_boundary(&self) -> bool {
        self.neighbors.iter().any(|n| n.is_none())
    }

    /// Which child of its parent this Elem is
    pub(crate) fn child_index(&self, parent: &Elem) -> usize {
        match parent
            .child_ids()
            .and_then(|ids| ids.iter().position(|id| *id == self.id))
        {
            Some(idx) => idx,
            None => panic!("Elem {} is not a child of Elem {}!", self.id, parent.id),
        }
    }

    pub(crate) fn set_refinement_flag(&mut self, flag: RefinementFlag) {
        self.refinement_flag = flag;
    }

    pub(crate) fn set_p_refinement_flag(&mut self, flag: RefinementFlag) {
        self.p_refinement_flag = flag;
    }

    pub(crate) fn set_children(&mut self, children: SmallVec<[ElemId; EXPECTED_NUM_CHILDREN]>) {
        assert!(
            self.children.is_none(),
            "Elem {} already has children; cannot set them again!",
            self.id
        );
        assert_eq!(
            children.len(),
            self.elem_type.n_children(),
            "{} Elems have {} children; cannot give Elem {} {} children!",
            self.elem_type,
            self.elem_type.n_children(),
            self.id,
            children.len()
        );
        self.children = Some(children);
    }

    pub(crate) fn take_children(&mut self) -> Option<SmallVec<[ElemId; EXPECTED_NUM_CHILDREN]>> {
        self.children.take()
    }

    /// Produce a Json Object that describes this Elem
    #[cfg(feature = "json_export")]
    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id.0,
            "type": self.elem_type.to_string(),
            "parent": self.parent.map(|p| p.0),
            "level": self.level,
            "active": self.active(),
            "nodes": self.nodes.iter().map(|n| n.0).collect::<Vec<usize>>(),
            "neighbors": JsonValue::from(
                self.neighbors.iter().map(|n| n.map(|id| id.0)).collect::<Vec<Option<usize>>>()
            ),
            "subdomain": self.subdomain_id,
            "p_level": self.p_level,
            "refinement_flag": self.refinement_flag,
            "p_refinement_flag": self.p_refinement_flag,
            "children": JsonValue::from(
                match &self.children {
                    Some(ids) => ids.iter().map(|id| id.0).collect(),
                    None => Vec::new(),
                }
            )
        }
    }
}

// Intermediate data structure used to represent a child [Elem] while its Nodes are being located
#[derive(Debug, Clone)]
pub(crate) struct ElemUninit {
    pub id: ElemId,
    elem_type: ElemType,
    nodes: SmallVec<[Option<NodeId>; 8]>,
    parent: ElemId,
    level: u8,
    subdomain_id: u32,
    owner_id: u32,
    p_level: u8,
    p_refinement_flag: RefinementFlag,
}

impl ElemUninit {
    /// A child of `parent` which inherits its type, subdomain, owner and p-refinement state
    pub fn new(id: ElemId, parent: &Elem) -> Self {
        Self {
            id,
            elem_type: parent.elem_type,
            nodes: smallvec![None; parent.elem_type.n_nodes()],
            parent: parent.id,
            level: parent.level + 1,
            subdomain_id: parent.subdomain_id,
            owner_id: parent.owner_id,
            p_level: parent.p_level,
            p_refinement_flag: parent.p_refinement_flag,
        }
    }

    pub fn set_node(&mut self, node_idx: usize, node_id: NodeId) {
        assert!(
            node_idx < self.nodes.len(),
            "Node indices must be less than {}; cannot set Node ({}) to {} on ElemUninit {}!",
            self.nodes.len(),
            node_idx,
            node_id,
            self.id
        );

        if let Some(current_id) = self.nodes[node_idx] {
            assert_eq!(
                current_id, node_id,
                "Node ({}) has already been set to {} on ElemUninit {}; Cannot set to {}",
                node_idx, current_id, self.id, node_id
            );
        } else {
            self.nodes[node_idx] = Some(node_id);
        }
    }

    pub fn into_elem(self) -> Result<Elem, MeshError> {
        let nodes: Option<SmallVec<[NodeId; 8]>> = self.nodes.iter().copied().collect();

        match nodes {
            Some(nodes) => Ok(Elem {
                id: self.id,
                elem_type: self.elem_type,
                nodes,
                neighbors: smallvec![None; self.elem_type.n_sides()],
                subdomain_id: self.subdomain_id,
                owner_id: self.owner_id,
                p_level: self.p_level,
                refinement_flag: RefinementFlag::JustRefined,
                p_refinement_flag: self.p_refinement_flag,
                level: self.level,
                parent: Some(self.parent),
                children: None,
            }),
            None => {
                log::debug!("incomplete child Elem: {}", self);
                Err(MeshError::UninitializedElem(self.id))
            }
        }
    }
}

impl fmt::Display for ElemUninit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let nodes = self
            .nodes
            .iter()
            .map(|n| match n {
                Some(id) => id.to_string(),
                None => String::from("_"),
            })
            .collect::<Vec<String>>()
            .join(", ");

        write!(
            f,
            "ID: {} \t parent: {} \t nodes: [{}]",
            self.id, self.parent, nodes
        )
    }
}
