//! Page interpretation model.
//!
//! The result of interpreting one scanned page image. Produced inside a worker
//! process, carried back through the codec, and consumed by
//! [`crate::castability::decide`]. Values are never mutated after a worker
//! produces them.

use crate::codec::Buffer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Selected option ids keyed by contest id.
pub type VotesDict = BTreeMap<String, Vec<String>>;

/// Input to the interpretation entry point: one scanned page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    /// Where the scanner wrote the image.
    pub path: PathBuf,
    /// Image bytes, when the caller already has them in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Buffer>,
}

impl ImageDescriptor {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(Buffer::new(data));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotType {
    Precinct,
    Absentee,
    Provisional,
}

/// Election context printed on (or encoded in) every ballot page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotMetadata {
    pub election_hash: String,
    pub ballot_style_id: String,
    pub precinct_id: String,
    pub ballot_type: BallotType,
    pub is_test_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmpbPageMetadata {
    #[serde(flatten)]
    pub ballot: BallotMetadata,
    pub page_number: u32,
}

/// One bubble on a hand-marked page and how filled it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotMark {
    pub contest_id: String,
    pub option_id: String,
    /// Fill ratio in `0.0..=1.0`.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkInfo {
    pub marks: Vec<BallotMark>,
}

/// Conditions that can send a hand-marked sheet to human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjudicationReason {
    UninterpretableBallot,
    MarginalMark,
    Overvote,
    Undervote,
    BlankBallot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjudicationReasonInfo {
    #[serde(rename = "type")]
    pub reason: AdjudicationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub option_ids: Vec<String>,
}

impl AdjudicationReasonInfo {
    pub fn new(reason: AdjudicationReason) -> Self {
        Self {
            reason,
            contest_id: None,
            option_ids: Vec::new(),
        }
    }

    pub fn in_contest(mut self, contest_id: impl Into<String>) -> Self {
        self.contest_id = Some(contest_id.into());
        self
    }
}

/// Whether a hand-marked page needs review, and why.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjudicationInfo {
    pub requires_adjudication: bool,
    #[serde(default)]
    pub enabled_reasons: Vec<AdjudicationReason>,
    #[serde(default)]
    pub enabled_reason_infos: Vec<AdjudicationReasonInfo>,
    #[serde(default)]
    pub ignored_reason_infos: Vec<AdjudicationReasonInfo>,
}

impl AdjudicationInfo {
    /// Sort detected conditions into enabled and ignored by the jurisdiction's
    /// enabled reasons. Review is required when any enabled condition was found.
    pub fn from_findings(
        enabled_reasons: Vec<AdjudicationReason>,
        findings: Vec<AdjudicationReasonInfo>,
    ) -> Self {
        let (enabled_reason_infos, ignored_reason_infos): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|info| enabled_reasons.contains(&info.reason));
        Self {
            requires_adjudication: !enabled_reason_infos.is_empty(),
            enabled_reasons,
            enabled_reason_infos,
            ignored_reason_infos,
        }
    }
}

/// Interpretation of one scanned page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PageInterpretation {
    /// Printed by a ballot-marking device; votes are decoded from the print.
    InterpretedBmdPage {
        ballot_id: String,
        metadata: BallotMetadata,
        votes: VotesDict,
    },
    /// Hand-marked page with per-contest selections derived from bubble scores.
    InterpretedHmpbPage {
        metadata: HmpbPageMetadata,
        #[serde(default)]
        mark_info: MarkInfo,
        votes: VotesDict,
        adjudication_info: AdjudicationInfo,
    },
    BlankPage,
    UnreadablePage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Variant discriminant of a [`PageInterpretation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    InterpretedBmd,
    InterpretedHmpb,
    Blank,
    Unreadable,
}

impl PageInterpretation {
    pub fn kind(&self) -> PageKind {
        match self {
            Self::InterpretedBmdPage { .. } => PageKind::InterpretedBmd,
            Self::InterpretedHmpbPage { .. } => PageKind::InterpretedHmpb,
            Self::BlankPage => PageKind::Blank,
            Self::UnreadablePage { .. } => PageKind::Unreadable,
        }
    }

    /// Adjudication flag of a hand-marked page; `None` for every other kind.
    pub fn requires_adjudication(&self) -> Option<bool> {
        match self {
            Self::InterpretedHmpbPage {
                adjudication_info, ..
            } => Some(adjudication_info.requires_adjudication),
            Self::InterpretedBmdPage { .. } | Self::BlankPage | Self::UnreadablePage { .. } => {
                None
            }
        }
    }

    pub fn votes(&self) -> Option<&VotesDict> {
        match self {
            Self::InterpretedBmdPage { votes, .. } | Self::InterpretedHmpbPage { votes, .. } => {
                Some(votes)
            }
            Self::BlankPage | Self::UnreadablePage { .. } => None,
        }
    }

    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self::UnreadablePage {
            reason: Some(reason.into()),
        }
    }
}
