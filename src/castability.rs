//! Sheet castability decisions.
//!
//! Combines the interpretations of both sides of one physical sheet into a
//! single disposition. The match in [`decide`] has no wildcard arm; every new
//! [`PageInterpretation`] variant has to be placed in it.

use crate::interpretation::PageInterpretation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What may be done with a scanned sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Castability {
    Uncastable,
    CastableWithoutReview,
    CastableWithReview,
}

impl Castability {
    pub fn is_castable(self) -> bool {
        !matches!(self, Self::Uncastable)
    }
}

impl fmt::Display for Castability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncastable => write!(f, "uncastable"),
            Self::CastableWithoutReview => write!(f, "castable without review"),
            Self::CastableWithReview => write!(f, "castable with review"),
        }
    }
}

/// Decide castability for a sheet from its front and back interpretations.
///
/// - BMD page with a blank reverse (either order): castable without review.
/// - Two hand-marked pages: castable with review if either page requires
///   adjudication, otherwise castable without review.
/// - Anything else: uncastable.
pub fn decide(front: &PageInterpretation, back: &PageInterpretation) -> Castability {
    use PageInterpretation::*;

    match (front, back) {
        (InterpretedBmdPage { .. }, BlankPage) | (BlankPage, InterpretedBmdPage { .. }) => {
            Castability::CastableWithoutReview
        }

        (
            InterpretedHmpbPage {
                adjudication_info: front_info,
                ..
            },
            InterpretedHmpbPage {
                adjudication_info: back_info,
                ..
            },
        ) => {
            if front_info.requires_adjudication || back_info.requires_adjudication {
                Castability::CastableWithReview
            } else {
                Castability::CastableWithoutReview
            }
        }

        (InterpretedBmdPage { .. }, InterpretedBmdPage { .. })
        | (InterpretedBmdPage { .. }, InterpretedHmpbPage { .. })
        | (InterpretedBmdPage { .. }, UnreadablePage { .. })
        | (InterpretedHmpbPage { .. }, InterpretedBmdPage { .. })
        | (InterpretedHmpbPage { .. }, BlankPage)
        | (InterpretedHmpbPage { .. }, UnreadablePage { .. })
        | (BlankPage, InterpretedHmpbPage { .. })
        | (BlankPage, BlankPage)
        | (BlankPage, UnreadablePage { .. })
        | (UnreadablePage { .. }, InterpretedBmdPage { .. })
        | (UnreadablePage { .. }, InterpretedHmpbPage { .. })
        | (UnreadablePage { .. }, BlankPage)
        | (UnreadablePage { .. }, UnreadablePage { .. }) => Castability::Uncastable,
    }
}
