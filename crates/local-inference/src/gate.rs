//! Serialization gate for lifecycle operations.
//!
//! At most one operation body runs at a time per gate. Waiters are served in
//! arrival order (tokio's mutex is fair). The guard lives inside the future, so
//! the gate is released on success, on error, and when the caller drops the
//! future mid-flight.
//!
//! Nested acquisition deadlocks. Operation bodies must call the unguarded
//! helpers of the manager, never another gated entry point.

use std::future::Future;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LifecycleError, Result};

#[derive(Default)]
struct GateState {
    closed: bool,
}

#[derive(Default)]
pub struct SerializationGate {
    state: Mutex<GateState>,
}

impl SerializationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` with exclusive access. Fails with `ManagerClosed` once
    /// the gate has been closed.
    pub async fn with_exclusive<F, Fut, T>(&self, name: &'static str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waited = Instant::now();
        let state = self.state.lock().await;
        Self::run_locked(name, waited, state, operation).await
    }

    /// Like `with_exclusive`, but gives up with `Cancelled` if `cancel` fires
    /// while still queued. Once the body has started, the body owns cancellation.
    pub async fn with_exclusive_or_cancel<F, Fut, T>(
        &self,
        name: &'static str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waited = Instant::now();
        let state = tokio::select! {
            state = self.state.lock() => state,
            _ = cancel.cancelled() => {
                debug!("{} cancelled while queued for the gate", name);
                return Err(LifecycleError::Cancelled { operation: name });
            }
        };
        Self::run_locked(name, waited, state, operation).await
    }

    async fn run_locked<F, Fut, T>(
        name: &'static str,
        waited: Instant,
        state: MutexGuard<'_, GateState>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if state.closed {
            return Err(LifecycleError::ManagerClosed);
        }
        debug!("Gate acquired for {} after {:?}", name, waited.elapsed());
        let result = operation().await;
        drop(state);
        debug!("Gate released by {}", name);
        result
    }

    /// Run a final operation and close the gate permanently, whatever its outcome.
    pub async fn close_after<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LifecycleError::ManagerClosed);
        }
        // Closed before running so a cancelled shutdown still leaves the gate shut.
        state.closed = true;
        operation().await
    }

    /// Snapshot; may be stale by the time the caller acts on it.
    pub fn is_closed(&self) -> bool {
        self.state.try_lock().map(|s| s.closed).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bodies_never_overlap() {
        let gate = Arc::new(SerializationGate::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                gate.with_exclusive("test", || async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let gate = Arc::new(SerializationGate::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.with_exclusive("holder", || async {
                    let _ = hold_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut waiters = Vec::new();
        for i in 0..5 {
            let gate = gate.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                gate.with_exclusive("waiter", || async {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .await
            }));
            // Let each waiter enqueue before the next arrives.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        hold_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        for w in waiters {
            w.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_released_after_failure_and_cancellation() {
        let gate = SerializationGate::new();

        let failed: Result<()> = gate
            .with_exclusive("fails", || async { Err(LifecycleError::catalog("boom")) })
            .await;
        assert!(failed.is_err());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            gate.with_exclusive("hangs", || async {
                std::future::pending::<()>().await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let ok = tokio::time::timeout(
            Duration::from_secs(1),
            gate.with_exclusive("after", || async { Ok(7) }),
        )
        .await
        .expect("gate must have been released");
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_never_runs_body() {
        let gate = Arc::new(SerializationGate::new());
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.with_exclusive("holder", || async {
                    let _ = hold_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let queued = {
            let gate = gate.clone();
            let ran = ran.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.with_exclusive_or_cancel("queued", &cancel, || async {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled { operation: "queued" }));
        hold_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects_callers() {
        let gate = SerializationGate::new();
        gate.close_after(|| async { Ok(()) }).await.unwrap();
        assert!(gate.is_closed());

        let err = gate
            .with_exclusive("late", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ManagerClosed));
        assert!(matches!(
            gate.close_after(|| async { Ok(()) }).await,
            Err(LifecycleError::ManagerClosed)
        ));
    }
}
