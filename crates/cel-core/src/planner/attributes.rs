//! Attributes: plan-time descriptors for identifier access paths.
//!
//! An attribute is a set of candidate names plus a trail of qualifiers,
//! resolved against the execution frame at evaluation time. Checked plans
//! carry a single fully-qualified candidate; parse-only plans carry the
//! container's candidate expansion and defer disambiguation to runtime.

use crate::planner::interpretable::Interpretable;

/// One candidate fully-qualified name. Absolute names skip the comprehension
/// scope stack and resolve directly against the base activation.
#[derive(Debug, Clone)]
pub(crate) struct CandidateName {
    pub name: String,
    pub absolute: bool,
}

/// A qualifier narrows a resolved value: field access, index, or a
/// presence test wrapped around either.
#[derive(Debug, Clone)]
pub(crate) enum Qualifier {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    PresenceTest(Box<Qualifier>),
}

#[derive(Debug, Clone)]
pub(crate) struct NamespacedAttribute {
    pub names: Vec<CandidateName>,
    pub qualifiers: Vec<Qualifier>,
}

#[derive(Clone)]
pub(crate) enum Attribute {
    /// Resolves the first candidate name that binds, then applies the
    /// qualifiers.
    Namespaced(NamespacedAttribute),
    /// Parse-only select chains: alternatives ordered most-qualified first,
    /// each a complete name-plus-qualifiers split of the same source path.
    /// The first alternative whose name binds wins.
    Maybe {
        /// the dotted source path accumulated so far, used to extend the
        /// alternatives when a further field selection is chained on
        path: String,
        alternatives: Vec<NamespacedAttribute>,
    },
    /// Qualifiers applied to a computed operand.
    Relative {
        operand: Box<Interpretable>,
        qualifiers: Vec<Qualifier>,
    },
    /// Known-unresolvable; raising is deferred until resolution.
    Missing { names: Vec<String> },
}

impl Attribute {
    /// The qualifier trail of this attribute, for in-place extension.
    pub fn qualifiers_mut(&mut self) -> Option<&mut Vec<Qualifier>> {
        match self {
            Self::Namespaced(attr) => Some(&mut attr.qualifiers),
            Self::Relative { qualifiers, .. } => Some(qualifiers),
            Self::Maybe { .. } | Self::Missing { .. } => None,
        }
    }

    /// Converts the last qualifier into a presence test. Returns false when
    /// there is no qualifier to convert.
    pub fn make_presence_test(&mut self) -> bool {
        let qualifiers = match self {
            Self::Namespaced(attr) => &mut attr.qualifiers,
            Self::Relative { qualifiers, .. } => qualifiers,
            Self::Maybe { alternatives, .. } => {
                // a bare-name alternative has no slot to test; presence
                // requires at least one qualifier
                alternatives.retain(|alt| !alt.qualifiers.is_empty());
                for alt in alternatives.iter_mut() {
                    if let Some(last) = alt.qualifiers.pop() {
                        alt.qualifiers.push(Qualifier::PresenceTest(Box::new(last)));
                    }
                }
                return !alternatives.is_empty();
            }
            Self::Missing { .. } => return false,
        };
        match qualifiers.pop() {
            Some(last) => {
                qualifiers.push(Qualifier::PresenceTest(Box::new(last)));
                true
            }
            None => false,
        }
    }
}
