//! Remote ICE candidate buffering
//!
//! Signaling does not order candidates relative to the offer/answer, so remote
//! candidates can arrive before the remote description is applied (on the
//! callee side, even before the user has accepted). They are queued here and
//! applied in arrival order right after the remote description is set. The
//! buffer is drained exactly once; from then on every candidate is applied
//! directly.

use crate::peer::ConnectionHandle;
use crate::types::IceCandidate;
use std::collections::VecDeque;

/// What to do with an arriving candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Held until the remote description is applied
    Buffered,
    /// Buffer already drained: apply to the connection now
    ApplyNow(IceCandidate),
}

/// Candidates waiting for the remote description
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate to the buffer
    pub fn push(&mut self, candidate: IceCandidate) -> Admission {
        if self.drained {
            Admission::ApplyNow(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Buffered
        }
    }

    /// Take every buffered candidate and mark the buffer drained
    ///
    /// Call only after the remote description has been applied. A second
    /// drain yields nothing.
    pub fn drain(&mut self) -> DrainedCandidates {
        self.drained = true;
        DrainedCandidates {
            candidates: self.pending.drain(..).collect(),
        }
    }

    /// Whether the buffer has been drained
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no candidate is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Candidates taken out of a buffer, in arrival order
#[derive(Debug, Default)]
#[must_use = "drained candidates must be applied to the connection"]
pub struct DrainedCandidates {
    candidates: Vec<IceCandidate>,
}

impl DrainedCandidates {
    /// Number of drained candidates
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether nothing was drained
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Apply every candidate in arrival order, returning how many were accepted
    ///
    /// A rejected candidate only removes one network path, so failures are
    /// logged and the rest are still applied.
    pub async fn apply_to(self, connection: &ConnectionHandle) -> usize {
        let mut applied = 0;
        for candidate in self.candidates {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(connection = %connection.id(), error = %e, "Buffered candidate rejected");
                }
            }
        }
        tracing::debug!(connection = %connection.id(), applied, "Buffered candidates applied");
        applied
    }

    /// Borrow the drained candidates
    pub fn as_slice(&self) -> &[IceCandidate] {
        &self.candidates
    }
}
