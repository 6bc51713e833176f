//! Generation counter for invalidating stale completions.
//!
//! Every session runs under its own generation. Any asynchronous work
//! (transport calls, notification callbacks) captures a [`GenerationToken`]
//! when it starts and checks it when it completes; once the session is
//! retired the counter has moved on and the completion is dropped. A plain
//! "is active" flag would not tell session N's late read apart from session
//! N+1's.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// Session generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Monotonic counter shared by all sessions of one client.
#[derive(Debug, Clone)]
pub struct GenerationCounter {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationCounter {
    /// Counter starting at generation 0 (no session).
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Current generation.
    pub fn current(&self) -> Generation {
        Generation(*self.tx.borrow())
    }

    /// Start a new generation and return it.
    pub fn advance(&self) -> Generation {
        let mut next = 0;
        self.tx.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        Generation(next)
    }

    /// Retire `generation` if it is still current.
    ///
    /// Returns `false` when something else already moved the counter on, so
    /// retiring twice (disconnect callback racing an explicit close) is harmless.
    pub fn retire(&self, generation: Generation) -> bool {
        self.tx.send_if_modified(|g| {
            if *g == generation.0 {
                *g += 1;
                true
            } else {
                false
            }
        })
    }

    /// Capture the current generation.
    pub fn token(&self) -> GenerationToken {
        let rx = self.tx.subscribe();
        let captured = Generation(*rx.borrow());
        GenerationToken { captured, rx }
    }
}

/// A captured generation that can be checked or awaited.
#[derive(Debug, Clone)]
pub struct GenerationToken {
    captured: Generation,
    rx: watch::Receiver<u64>,
}

impl GenerationToken {
    /// Generation this token was captured under.
    pub fn generation(&self) -> Generation {
        self.captured
    }

    /// Whether the captured generation is still the live one.
    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.captured.0
    }

    /// Resolve once the captured generation has been retired.
    ///
    /// Cancel-safe; usable as a `select!` branch.
    pub async fn retired(&mut self) {
        let captured = self.captured.0;
        // The sender lives as long as any counter clone; if every clone is
        // gone nothing can ever complete against this generation either.
        let _ = self.rx.wait_for(|g| *g != captured).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_advance_is_monotonic() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), Generation(0));
        assert_eq!(counter.advance(), Generation(1));
        assert_eq!(counter.advance(), Generation(2));
        assert_eq!(counter.current(), Generation(2));
    }

    #[test]
    fn test_retire_only_current() {
        let counter = GenerationCounter::new();
        let g1 = counter.advance();
        assert!(counter.retire(g1));
        // Second retire is a no-op
        assert!(!counter.retire(g1));
        assert_eq!(counter.current(), Generation(2));

        let g3 = counter.advance();
        assert!(!counter.retire(g1));
        assert_eq!(counter.current(), g3);
    }

    #[test]
    fn test_token_goes_stale() {
        let counter = GenerationCounter::new();
        let g = counter.advance();
        let token = counter.token();
        assert_eq!(token.generation(), g);
        assert!(token.is_current());

        counter.retire(g);
        assert!(!token.is_current());
    }

    #[tokio::test]
    async fn test_retired_wakes_waiter() {
        let counter = GenerationCounter::new();
        let g = counter.advance();
        let mut token = counter.token();

        let waiter = tokio::spawn(async move {
            token.retired().await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        counter.retire(g);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }
}
