//! Single-shot close latch (Design Notes §9: "once { err = f(); done = true };
//! wait()").
//!
//! Both `Session` and `Server` close through one of these: the first caller
//! to reach `close_with` runs the supplied future and its result is memoized
//! for every later caller; everyone else observes the same value without
//! re-running the close logic. `wait()` lets read/recv loops select against
//! the gate firing.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, Notify};

use crate::error::MdpError;

/// The aggregated result of closing every endpoint underneath a session or
/// server. `Ok(())` if every underlying close succeeded; otherwise the last
/// error observed (spec §7: "closed is returned once via the close gate to
/// every caller").
pub type CloseResult = Result<(), Arc<MdpError>>;

pub struct CloseGate {
    result: OnceLock<CloseResult>,
    notify: Notify,
    // Serializes the single "do the real work" critical section; everything
    // after the first closer short-circuits on `result` before even trying
    // to acquire this.
    closing: Mutex<()>,
}

impl Default for CloseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseGate {
    pub fn new() -> Self {
        Self {
            result: OnceLock::new(),
            notify: Notify::new(),
            closing: Mutex::new(()),
        }
    }

    /// True once the gate has fired, regardless of which caller drove it.
    pub fn is_closed(&self) -> bool {
        self.result.get().is_some()
    }

    /// Run `f` exactly once across all concurrent callers; every caller,
    /// including the one that ran `f`, gets the same memoized result.
    pub async fn close_with<F, Fut>(&self, f: F) -> CloseResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CloseResult>,
    {
        if let Some(r) = self.result.get() {
            return r.clone();
        }
        let _guard = self.closing.lock().await;
        if let Some(r) = self.result.get() {
            return r.clone();
        }
        let result = f().await;
        // `set` can only fail if another caller raced us between the guard
        // being acquired and here, which the mutex already rules out.
        let _ = self.result.set(result.clone());
        self.notify.notify_waiters();
        result
    }

    /// Resolves once the gate has fired. Safe to call before or after
    /// `close_with` — a late subscriber still observes the fired state
    /// because of the `is_closed` check taken after constructing the
    /// `Notified` future, per `tokio::sync::Notify`'s race-free pattern.
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn close_once_runs_body_a_single_time() {
        let gate = CloseGate::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let fut = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        let (a, b) = tokio::join!(
            gate.close_with(|| fut(runs.clone())),
            gate.close_with(|| fut(runs.clone())),
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn wait_resolves_after_close() {
        let gate = Arc::new(CloseGate::new());
        let waiter_gate = gate.clone();
        let waiter = tokio::spawn(async move {
            waiter_gate.wait().await;
        });

        gate.close_with(|| async { Ok(()) }).await;
        waiter.await.unwrap();
    }
}
