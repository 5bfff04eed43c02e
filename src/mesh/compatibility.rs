//! Refinement flags are requested per Elem, but refining or coarsening one Elem constrains its neighbors and siblings.
//! These rules adjust the flags of the whole Mesh until they can be executed together.

use super::{elem::ElemId, refinement::MeshError, refinement::RefinementFlag, Mesh};

impl Mesh {
    /// Apply the refinement and coarsening rules until neither changes a flag, then mark the parents which will be coarsened
    pub(crate) fn make_flags_compatible(&mut self) -> Result<(), MeshError> {
        let mut n_passes = 0;
        loop {
            let mut changed = false;
            if self.settings.level_one_rule {
                changed |= self.make_refinement_compatible()?;
            }
            changed |= self.make_coarsening_compatible();

            n_passes += 1;
            if !changed {
                break;
            }
        }
        log::trace!("refinement flags were compatible after {} passes", n_passes);

        self.update_parent_coarsen_flags();
        Ok(())
    }

    /// Level-one rule for refinement:
    /// * an active neighbor one level coarser than an Elem flagged `Refine` must also be refined
    /// * a neighbor on the same level can no longer be coarsened
    ///
    /// If the coarser neighbor cannot be refined, the Elem's own refinement is cancelled.
    ///
    /// Returns `true` if any flags changed
    pub(crate) fn make_refinement_compatible(&mut self) -> Result<bool, MeshError> {
        let mut changed = false;

        for elem_id in self.flagged_active_elems(RefinementFlag::Refine) {
            // an earlier cancellation in this pass may have cleared the flag
            if self.elem(elem_id).refinement_flag() != RefinementFlag::Refine {
                continue;
            }

            let level = self.elem(elem_id).level();
            let neighbors: Vec<ElemId> = self.elem(elem_id).neighbors.iter().flatten().copied().collect();

            for neighbor_id in neighbors {
                let neighbor = self.elem(neighbor_id);
                if !neighbor.active() {
                    continue;
                }
                let (neighbor_level, neighbor_flag) = (neighbor.level(), neighbor.refinement_flag());

                if neighbor_level < level && neighbor_flag != RefinementFlag::Refine {
                    if self.elem_is_h_refineable(neighbor_id)? {
                        self.elem_mut(neighbor_id).set_refinement_flag(RefinementFlag::Refine);
                    } else {
                        log::debug!(
                            "Elem {} cannot be refined; cancelling the refinement of its neighbor {}",
                            neighbor_id,
                            elem_id
                        );
                        self.elem_mut(elem_id).set_refinement_flag(RefinementFlag::DoNothing);
                    }
                    changed = true;
                } else if neighbor_level == level && neighbor_flag == RefinementFlag::Coarsen {
                    self.elem_mut(neighbor_id).set_refinement_flag(RefinementFlag::DoNothing);
                    changed = true;
                }
            }
        }

        Ok(changed)
    }

    /// Coarsening rules:
    /// * root-level Elems cannot be coarsened
    /// * (level-one rule) an Elem cannot be coarsened next to a finer (refined) neighbor, or next to a same-level neighbor flagged for refinement
    /// * a parent is only coarsened if all of its children are active and flagged `Coarsen`
    ///
    /// Returns `true` if any flags changed
    pub(crate) fn make_coarsening_compatible(&mut self) -> bool {
        let mut changed = false;

        for elem_id in self.flagged_active_elems(RefinementFlag::Coarsen) {
            let elem = self.elem(elem_id);
            let blocked = elem.parent_id().is_none()
                || (self.settings.level_one_rule
                    && elem.neighbors.iter().flatten().any(|neighbor_id| {
                        let neighbor = self.elem(*neighbor_id);
                        !neighbor.active()
                            || (neighbor.level() == elem.level()
                                && neighbor.refinement_flag() == RefinementFlag::Refine)
                    }));

            if blocked {
                self.elem_mut(elem_id).set_refinement_flag(RefinementFlag::DoNothing);
                changed = true;
            }
        }

        for elem_id in self.flagged_active_elems(RefinementFlag::Coarsen) {
            let parent_id = match self.elem(elem_id).parent_id() {
                Some(id) => id,
                None => continue,
            };

            if !self.all_children_flagged_for_coarsening(parent_id) {
                self.elem_mut(elem_id).set_refinement_flag(RefinementFlag::DoNothing);
                changed = true;
            }
        }

        changed
    }

    /// Mark each inactive parent `CoarsenInactive` if all of its children are flagged for coarsening, and `Inactive` otherwise
    pub(crate) fn update_parent_coarsen_flags(&mut self) {
        let parents: Vec<ElemId> = self
            .elems()
            .filter(|elem| !elem.active() && elem.has_children())
            .map(|elem| elem.id)
            .collect();

        for parent_id in parents {
            let flag = self.elem(parent_id).refinement_flag();
            let flag = if self.all_children_flagged_for_coarsening(parent_id) {
                flag.coarsen_requested(parent_id)
            } else {
                RefinementFlag::Inactive
            };
            self.elem_mut(parent_id).set_refinement_flag(flag);
        }
    }

    fn all_children_flagged_for_coarsening(&self, parent_id: ElemId) -> bool {
        match self.elem(parent_id).child_ids() {
            Some(child_ids) => child_ids.iter().all(|child_id| {
                let child = self.elem(*child_id);
                child.active() && child.refinement_flag() == RefinementFlag::Coarsen
            }),
            None => false,
        }
    }

    fn flagged_active_elems(&self, flag: RefinementFlag) -> Vec<ElemId> {
        self.active_elems()
            .filter(|elem| elem.refinement_flag() == flag)
            .map(|elem| elem.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_elems_cannot_coarsen() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.flag_elems_for_coarsening(vec![ElemId(0)]).unwrap();
        assert!(mesh.make_coarsening_compatible());
        assert_eq!(mesh.elem(ElemId(0)).refinement_flag(), RefinementFlag::DoNothing);
        assert!(!mesh.make_coarsening_compatible());
    }

    #[test]
    fn refinement_cancels_neighbor_coarsening() {
        let mut mesh = Mesh::square_grid(2, 1, 1.0);
        mesh.uniformly_refine(1).unwrap();

        let west = mesh.elem(ElemId(0)).child_ids().unwrap().to_vec();
        let east = mesh.elem(ElemId(1)).child_ids().unwrap().to_vec();
        mesh.flag_elems_for_coarsening(west.clone()).unwrap();
        // SW child of the eastern parent touches the SE child of the western parent
        mesh.flag_elems_for_refinement(vec![east[0]]).unwrap();
        assert_eq!(mesh.elem(ElemId(0)).refinement_flag(), RefinementFlag::CoarsenInactive);

        mesh.make_flags_compatible().unwrap();

        assert!(west
            .iter()
            .all(|id| mesh.elem(*id).refinement_flag() == RefinementFlag::DoNothing));
        assert_eq!(mesh.elem(ElemId(0)).refinement_flag(), RefinementFlag::Inactive);
        assert_eq!(mesh.elem(east[0]).refinement_flag(), RefinementFlag::Refine);
    }

    #[test]
    fn refinement_propagates() {
        let mut mesh = Mesh::square_grid(3, 1, 1.0);
        mesh.flag_elems_for_refinement(vec![ElemId(0)]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();
        mesh.flag_elems_for_refinement(vec![ElemId(1)]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();

        // the eastern grandchild of Elem 1 borders a level-1 child of Elem 2
        let east_child = mesh.elem(ElemId(1)).child_ids().unwrap()[1];
        mesh.flag_elems_for_refinement(vec![east_child]).unwrap();
        mesh.refine_and_coarsen_elements().unwrap();
        let east_grandchild = mesh.elem(east_child).child_ids().unwrap()[1];

        mesh.flag_elems_for_refinement(vec![east_grandchild]).unwrap();
        mesh.make_flags_compatible().unwrap();

        let neighbor = mesh.elem(east_grandchild).neighbors[3].unwrap();
        assert_eq!(mesh.elem(neighbor).level(), 1);
        assert_eq!(mesh.elem(neighbor).refinement_flag(), RefinementFlag::Refine);
    }
}
