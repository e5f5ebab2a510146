use crate::{codec::ProtocolMessage, types::OutletState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied(OutletState),
    /// A tokened reply that does not answer the outstanding request.
    Stale { token: u32, expected: Option<u32> },
}

/// Tracks sync requests so a reply from an earlier connection cannot
/// overwrite state reconciled on the current one.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    generation: u32,
    outstanding: Option<u32>,
    tokens_on_wire: bool,
}

impl Reconciler {
    pub fn new(tokens_on_wire: bool) -> Self {
        Self {
            tokens_on_wire,
            ..Self::default()
        }
    }

    pub fn outstanding(&self) -> Option<u32> {
        self.outstanding
    }

    pub fn request(&mut self) -> ProtocolMessage {
        self.generation = self.generation.wrapping_add(1);
        self.outstanding = Some(self.generation);
        ProtocolMessage::SyncRequest {
            token: self.tokens_on_wire.then_some(self.generation),
        }
    }

    /// Remote state is authoritative: an accepted reply replaces local state
    /// wholesale. Untokened replies are always accepted since the legacy
    /// server also pushes status unprompted after telemetry.
    pub fn accept(&mut self, outlets: OutletState, token: Option<u32>) -> SyncOutcome {
        match token {
            Some(token) if self.outstanding == Some(token) => {
                self.outstanding = None;
                SyncOutcome::Applied(outlets)
            }
            Some(token) => SyncOutcome::Stale {
                token,
                expected: self.outstanding,
            },
            None => {
                self.outstanding = None;
                SyncOutcome::Applied(outlets)
            }
        }
    }

    pub fn abandon(&mut self) {
        self.outstanding = None;
    }
}
