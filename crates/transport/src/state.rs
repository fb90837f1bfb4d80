use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::error::{Result, TransportError};

/// Lifecycle of a transport.
///
/// `Created → Opening → Open → Closing → Closed`, with `Faulted` reachable
/// from `Opening` or `Open`. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
    Faulted,
}

impl TransportState {
    /// `Closed` and `Faulted` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }

    fn can_become(self, next: Self) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Created, Opening)
                | (Opening, Open)
                | (Opening | Open, Faulted)
                | (Created | Opening | Open, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// State holder shared by the transport implementations.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<TransportState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Created),
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if that is a legal transition. Returns whether it was.
    pub(crate) fn advance(&self, next: TransportState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_become(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn begin_open(&self) -> Result<()> {
        if self.advance(TransportState::Opening) {
            Ok(())
        } else {
            Err(TransportError::AlreadyStarted { state: self.get() })
        }
    }

    /// Returns `false` when a close already happened or is under way.
    pub(crate) fn begin_close(&self) -> bool {
        self.advance(TransportState::Closing)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.get() {
            TransportState::Open => Ok(()),
            state => Err(TransportError::NotOpen { state }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lc = Lifecycle::new();
        assert_eq!(lc.get(), TransportState::Created);
        lc.begin_open().unwrap();
        assert!(lc.advance(TransportState::Open));
        lc.ensure_open().unwrap();
        assert!(lc.begin_close());
        assert!(lc.advance(TransportState::Closed));
        assert!(lc.get().is_terminal());
    }

    #[test]
    fn test_transitions_are_one_way() {
        let lc = Lifecycle::new();
        lc.begin_open().unwrap();
        assert!(lc.advance(TransportState::Open));
        assert!(!lc.advance(TransportState::Opening));
        assert!(!lc.advance(TransportState::Created));
    }

    #[test]
    fn test_faulted_is_terminal() {
        let lc = Lifecycle::new();
        lc.begin_open().unwrap();
        assert!(lc.advance(TransportState::Faulted));
        assert!(!lc.begin_close());
        assert!(!lc.advance(TransportState::Open));
        assert_eq!(lc.get(), TransportState::Faulted);
    }

    #[test]
    fn test_fault_not_reachable_from_created() {
        let lc = Lifecycle::new();
        assert!(!lc.advance(TransportState::Faulted));
    }

    #[test]
    fn test_close_from_created() {
        let lc = Lifecycle::new();
        assert!(lc.begin_close());
        assert!(lc.advance(TransportState::Closed));
        assert!(!lc.begin_close());
    }

    #[test]
    fn test_open_twice_rejected() {
        let lc = Lifecycle::new();
        lc.begin_open().unwrap();
        assert!(matches!(
            lc.begin_open(),
            Err(TransportError::AlreadyStarted {
                state: TransportState::Opening
            })
        ));
    }

    #[test]
    fn test_ensure_open_reports_state() {
        let lc = Lifecycle::new();
        let err = lc.ensure_open().unwrap_err();
        assert_eq!(err.to_string(), "transport is not open (state: created)");
    }
}
