use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::{Error, Result};

/// Absolute time budget for one request, shared by every stage it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Await `fut` within the remaining budget, failing with `Timeout { stage }`.
    pub async fn run<T, F>(&self, stage: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.at {
            None => fut.await,
            Some(_) if self.is_expired() => Err(Error::Timeout { stage }),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Error::Timeout { stage })?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_runs_to_completion() {
        let out = Deadline::none().run("stage", async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
        assert!(Deadline::none().remaining().is_none());
    }

    #[tokio::test]
    async fn test_timeout_names_stage() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let err = deadline
            .run("inference", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { stage: "inference" }));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_fast() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(deadline.is_expired());
        let err = deadline.run("upsert", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { stage: "upsert" }));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = Deadline::after(Duration::from_secs(1))
            .run::<(), _>("search", async { Err(Error::NotFound("x".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
