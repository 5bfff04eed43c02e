use super::elem::ElemId;
use super::MAX_P_LEVEL;
#[cfg(feature = "json_export")]
use json::JsonValue;
use std::fmt;

/// Refinement state of an `Elem`
///
/// The same state space is used for geometric (h) and polynomial (p) refinement; each `Elem` carries one flag per axis.
///
/// ```text
///  DoNothing --mark--> Refine --refine--> Inactive (parent)      children: JustRefined
///  Inactive --all children Coarsen--> CoarsenInactive --coarsen--> JustCoarsened --contract--> DoNothing
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefinementFlag {
    Inactive,
    Refine,
    JustRefined,
    Coarsen,
    CoarsenInactive,
    JustCoarsened,
    DoNothing,
}

impl RefinementFlag {
    /// Is an `Elem` carrying this flag part of the active (leaf) layer of the Mesh
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Inactive | Self::CoarsenInactive)
    }

    /// Can this flag be requested by a refinement driver (as opposed to being set by the Mesh itself)
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Refine | Self::Coarsen | Self::DoNothing)
    }

    /// `Refine -> Inactive`: the `Elem` has just become a parent
    pub(crate) fn refined(self, elem_id: ElemId) -> Self {
        assert_eq!(
            self,
            Self::Refine,
            "Elem {} is not flagged for refinement; cannot refine!",
            elem_id
        );
        Self::Inactive
    }

    /// `Inactive -> CoarsenInactive`: all of the `Elem`s children have requested coarsening
    pub(crate) fn coarsen_requested(self, elem_id: ElemId) -> Self {
        assert!(
            matches!(self, Self::Inactive | Self::CoarsenInactive),
            "Elem {} is {:?}; only parent Elems can be marked for coarsening!",
            elem_id,
            self
        );
        Self::CoarsenInactive
    }

    /// `CoarsenInactive -> JustCoarsened`: the `Elem` is active again
    pub(crate) fn coarsened(self, elem_id: ElemId) -> Self {
        assert_eq!(
            self,
            Self::CoarsenInactive,
            "Elem {} is not marked CoarsenInactive; cannot coarsen!",
            elem_id
        );
        Self::JustCoarsened
    }

    /// `JustCoarsened -> DoNothing`; all other flags are unchanged by a contraction
    pub(crate) fn contracted(self) -> Self {
        match self {
            Self::JustCoarsened => Self::DoNothing,
            other => other,
        }
    }

    /// Reset transitional flags once a refinement step is complete
    pub(crate) fn cleaned(self) -> Self {
        if self.is_active() {
            Self::DoNothing
        } else {
            Self::Inactive
        }
    }
}

impl Default for RefinementFlag {
    fn default() -> Self {
        Self::DoNothing
    }
}

impl fmt::Display for RefinementFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::Refine => "REFINE",
            Self::JustRefined => "JUST_REFINED",
            Self::Coarsen => "COARSEN",
            Self::CoarsenInactive => "COARSEN_INACTIVE",
            Self::JustCoarsened => "JUST_COARSENED",
            Self::DoNothing => "DO_NOTHING",
        };
        write!(f, "{}", name)
    }
}

#[cfg(feature = "json_export")]
impl From<RefinementFlag> for JsonValue {
    fn from(flag: RefinementFlag) -> Self {
        JsonValue::from(flag.to_string())
    }
}

/// Apply a p-refinement flag to a polynomial level
///
/// Returns the new level and the flag the `Elem` should carry afterwards
pub(crate) fn apply_p_flag(
    elem_id: ElemId,
    p_level: u8,
    flag: RefinementFlag,
) -> Result<(u8, RefinementFlag), MeshError> {
    match flag {
        RefinementFlag::Refine => {
            if p_level >= MAX_P_LEVEL {
                Err(MeshError::ExceededMaxPLevel(elem_id))
            } else {
                Ok((p_level + 1, RefinementFlag::JustRefined))
            }
        }
        RefinementFlag::Coarsen => Ok((p_level.saturating_sub(1), RefinementFlag::JustCoarsened)),
        other => Ok((p_level, other)),
    }
}

/// Recoverable errors produced while flagging and refining a Mesh
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("Elem {0} does not exist; Cannot apply refinement!")]
    ElemDoesntExist(ElemId),
    #[error("Multiple refinements were specified for Elem {0}; Cannot apply refinements!")]
    DoubleRefinement(ElemId),
    #[error("Elem {0} is not active; Only active Elems can be flagged for refinement!")]
    ElemNotActive(ElemId),
    #[error("{flag} cannot be requested for Elem {elem_id}; Only REFINE, COARSEN and DO_NOTHING are valid requests!")]
    InvalidRequest { elem_id: ElemId, flag: RefinementFlag },
    #[error("p-Refinement of Elem {0} would exceed the maximum p-level ({max})", max = MAX_P_LEVEL)]
    ExceededMaxPLevel(ElemId),
    #[error("Not all Nodes of child Elem {0} could be located; cannot complete refinement!")]
    UninitializedElem(ElemId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity() {
        assert!(!RefinementFlag::Inactive.is_active());
        assert!(!RefinementFlag::CoarsenInactive.is_active());
        assert!(RefinementFlag::JustCoarsened.is_active());
        assert!(RefinementFlag::Refine.is_active());
        assert!(RefinementFlag::Coarsen.is_active());
    }

    #[test]
    fn full_cycle() {
        let id = ElemId(0);
        let parent = RefinementFlag::Refine.refined(id);
        assert_eq!(parent, RefinementFlag::Inactive);

        let parent = parent.coarsen_requested(id).coarsened(id);
        assert_eq!(parent, RefinementFlag::JustCoarsened);
        assert_eq!(parent.contracted(), RefinementFlag::DoNothing);
        assert_eq!(RefinementFlag::Refine.contracted(), RefinementFlag::Refine);
    }

    #[test]
    fn cleaning() {
        assert_eq!(RefinementFlag::JustRefined.cleaned(), RefinementFlag::DoNothing);
        assert_eq!(RefinementFlag::JustCoarsened.cleaned(), RefinementFlag::DoNothing);
        assert_eq!(RefinementFlag::CoarsenInactive.cleaned(), RefinementFlag::Inactive);
    }

    #[test]
    #[should_panic]
    fn refine_unflagged() {
        RefinementFlag::DoNothing.refined(ElemId(3));
    }

    #[test]
    #[should_panic]
    fn coarsen_without_request() {
        RefinementFlag::Inactive.coarsened(ElemId(3));
    }

    #[test]
    #[should_panic]
    fn coarsen_request_on_active() {
        RefinementFlag::DoNothing.coarsen_requested(ElemId(3));
    }

    #[test]
    fn p_levels() {
        let id = ElemId(1);
        assert_eq!(
            apply_p_flag(id, 2, RefinementFlag::Refine),
            Ok((3, RefinementFlag::JustRefined))
        );
        assert_eq!(
            apply_p_flag(id, 0, RefinementFlag::Coarsen),
            Ok((0, RefinementFlag::JustCoarsened))
        );
        assert_eq!(
            apply_p_flag(id, MAX_P_LEVEL, RefinementFlag::Refine),
            Err(MeshError::ExceededMaxPLevel(id))
        );
        assert_eq!(
            apply_p_flag(id, 4, RefinementFlag::DoNothing),
            Ok((4, RefinementFlag::DoNothing))
        );
    }
}
