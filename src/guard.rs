//! Active-session guard
//!
//! Ending the session must cause any in-flight periodic write to abort
//! without true task cancellation: the write may finish its network round
//! trip but must skip its final state mutation. Rather than repeating the
//! flag check at every call site, the re-check discipline lives in one
//! combinator: check before initiating, await, check again before the
//! caller commits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared end-of-session flag. Flipped synchronously, exactly once.
#[derive(Clone)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip to inactive. Returns `true` only for the caller that actually
    /// performed the transition, making session end idempotent.
    pub fn deactivate(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// Run an async operation under the guard discipline.
    ///
    /// Returns `None` without running the operation when the session has
    /// already ended, and `None` discarding the result when the session
    /// ended while the operation was in flight. A `Some` result is safe to
    /// commit.
    pub async fn guard<T, Fut>(&self, op: Fut) -> Option<T>
    where
        Fut: Future<Output = T>,
    {
        if !self.is_active() {
            return None;
        }
        let value = op.await;
        if !self.is_active() {
            return None;
        }
        Some(value)
    }
}

impl Default for ActiveFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deactivate_is_idempotent() {
        let flag = ActiveFlag::new();
        assert!(flag.is_active());
        assert!(flag.deactivate());
        assert!(!flag.deactivate());
        assert!(!flag.is_active());
    }

    #[tokio::test]
    async fn guard_skips_when_already_ended() {
        let flag = ActiveFlag::new();
        flag.deactivate();

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_inner = ran.clone();
        let result = flag
            .guard(async move {
                ran_inner.store(true, Ordering::SeqCst);
                7
            })
            .await;

        assert!(result.is_none());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn guard_discards_result_when_ended_mid_flight() {
        let flag = ActiveFlag::new();
        let flag_inner = flag.clone();

        let result = flag
            .guard(async move {
                // The session ends while the write is in flight.
                flag_inner.deactivate();
                7
            })
            .await;

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn guard_passes_result_through_while_active() {
        let flag = ActiveFlag::new();
        assert_eq!(flag.guard(async { 7 }).await, Some(7));
    }
}
