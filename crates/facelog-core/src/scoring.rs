//! Scoring: index distance → similarity → confidence band.

use crate::index::Neighbor;
use crate::types::CandidateMatch;

/// Acceptance threshold `τ` and hysteresis margin `δ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub accept: f32,
    pub margin: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            accept: 0.50,
            margin: 0.05,
        }
    }
}

impl Thresholds {
    /// Lower edge of the ambiguous band, `τ - δ`.
    pub fn hold_floor(&self) -> f32 {
        self.accept - self.margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// `similarity >= τ`
    Confident,
    /// `τ - δ <= similarity < τ`
    Ambiguous,
    /// Below the hold floor, or no candidates at all.
    Rejected,
}

/// Outcome of scoring a top-K reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Scored {
    Confident(CandidateMatch),
    Ambiguous(CandidateMatch),
    Rejected(Option<CandidateMatch>),
}

impl Scored {
    pub fn band(&self) -> Band {
        match self {
            Self::Confident(_) => Band::Confident,
            Self::Ambiguous(_) => Band::Ambiguous,
            Self::Rejected(_) => Band::Rejected,
        }
    }

    pub fn best(&self) -> Option<&CandidateMatch> {
        match self {
            Self::Confident(c) | Self::Ambiguous(c) => Some(c),
            Self::Rejected(c) => c.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    thresholds: Thresholds,
}

impl Scorer {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Both bounds are inclusive; NaN falls through to `Rejected`.
    pub fn classify(&self, similarity: f32) -> Band {
        if similarity >= self.thresholds.accept {
            Band::Confident
        } else if similarity >= self.thresholds.hold_floor() {
            Band::Ambiguous
        } else {
            Band::Rejected
        }
    }

    /// Pick the best neighbor and classify it.
    ///
    /// Ties keep the first neighbor in index order.
    pub fn evaluate(&self, neighbors: &[Neighbor]) -> Scored {
        let mut best: Option<CandidateMatch> = None;
        for n in neighbors {
            let similarity = 1.0 - n.distance;
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(CandidateMatch {
                    identity_id: n.identity_id.clone(),
                    similarity,
                });
            }
        }

        match best {
            Some(c) => match self.classify(c.similarity) {
                Band::Confident => Scored::Confident(c),
                Band::Ambiguous => Scored::Ambiguous(c),
                Band::Rejected => Scored::Rejected(Some(c)),
            },
            None => Scored::Rejected(None),
        }
    }
}
