use std::fmt;

/// Progress of a request that depends on a preflight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The preflight has not completed; the request must not be encoded yet.
    WaitingOnPreflight,
    /// Free to be encoded and submitted.
    Ready,
    /// Handed to the engine.
    Sent,
}

/// A request paired with the stage of its preflight.
///
/// Used to re-encode a request only after a schema refresh has completed,
/// without the request holding on to the refresh itself.
pub struct Staged<T> {
    request: T,
    stage: Stage,
}

impl<T: fmt::Debug> fmt::Debug for Staged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Staged")
            .field("request", &self.request)
            .field("stage", &self.stage)
            .finish()
    }
}

impl<T> Staged<T> {
    pub fn ready(request: T) -> Self {
        Self {
            request,
            stage: Stage::Ready,
        }
    }

    pub fn after_preflight(request: T) -> Self {
        Self {
            request,
            stage: Stage::WaitingOnPreflight,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn request(&self) -> &T {
        &self.request
    }

    /// `WaitingOnPreflight -> Ready`.
    pub fn preflight_done(&mut self) -> bool {
        self.advance(Stage::WaitingOnPreflight, Stage::Ready)
    }

    /// Re-arms a sent request for another round, with or without a preflight.
    pub fn rearm(&mut self, preflight: bool) -> bool {
        let to = if preflight {
            Stage::WaitingOnPreflight
        } else {
            Stage::Ready
        };
        self.advance(Stage::Sent, to)
    }

    /// `Ready -> Sent`, yielding the request to submit.
    pub fn send(&mut self) -> Option<&T> {
        if self.advance(Stage::Ready, Stage::Sent) {
            Some(&self.request)
        } else {
            None
        }
    }

    fn advance(&mut self, from: Stage, to: Stage) -> bool {
        if self.stage != from {
            return false;
        }
        self.stage = to;
        true
    }
}
