//! Adaptive h/p Mesh hierarchy with a spatial index for point location and ray casting
//!
//! A [`Mesh`] owns a tree of [`Elem`]s (every refinement keeps the parent and adds its children) and a deduplicating [`NodePool`].
//! Refinement is driven by flags: request `Refine`/`Coarsen` on active Elems, then call [`Mesh::refine_and_coarsen_elements`] to make the flags compatible and execute them as one batch.
//!
//! A [`Tree`] indexes the active Elems (or their Nodes, or the boundary of the domain) of a Mesh, and answers "which Elem contains this point" and "which Elem does this ray hit first".
//!
//! ```
//! use amr_mesh::{BuildType, ElemId, Mesh, Point, Tree};
//!
//! let mut mesh = Mesh::square_grid(2, 2, 0.5);
//! mesh.flag_elems_for_refinement(vec![ElemId(0)]).unwrap();
//! mesh.refine_and_coarsen_elements().unwrap();
//! assert_eq!(mesh.n_active_elem(), 7);
//!
//! let tree = Tree::new(&mesh, BuildType::Elements);
//! let elem_id = tree.find_element(&Point::new(0.1, 0.1, 0.0)).unwrap();
//! assert_eq!(mesh.elem(elem_id).level(), 1);
//! ```

/// The adaptive Mesh and its refinement machinery
pub mod mesh;
/// Spatial index over the active part of a Mesh
pub mod tree;

pub use mesh::{
    elem::{Elem, ElemId},
    node::{Node, NodeId, NodePool},
    refinement::{MeshError, RefinementFlag},
    shape::{ElemShape, ElemType},
    space::{BoundingBox, Point, V3D},
    Mesh, RefinementSettings,
};
pub use tree::{BuildType, Tree, TreeSettings};
