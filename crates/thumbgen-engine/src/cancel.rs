use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared cancellation flag, checked at every stage boundary.
///
/// A blocking request that is already on the wire is not interrupted;
/// its result is discarded at the next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationTicket {
    id: u64,
    cancel: CancelToken,
}

impl GenerationTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Serializes generation calls for one user session: starting a call
/// cancels the one before it, and only the newest ticket may deliver.
#[derive(Debug, Default)]
pub struct GenerationSession {
    latest: AtomicU64,
    active: Mutex<Option<CancelToken>>,
}

impl GenerationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> GenerationTicket {
        let cancel = CancelToken::new();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let id = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = active.replace(cancel.clone()) {
            previous.cancel();
        }
        GenerationTicket { id, cancel }
    }

    pub fn is_current(&self, ticket: &GenerationTicket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.id
    }

    /// Cancels whatever call is in flight without starting a new one.
    pub fn cancel_active(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = active.as_ref() {
            token.cancel();
        }
    }

    pub fn latest_id(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }
}
