//! Per-operation cancellation and deadlines.
//!
//! Every store operation takes an [`OpContext`]. The context is raced against the operation's
//! future: when the token is cancelled or the deadline passes, the in-flight future is dropped
//! (which rolls back any open transaction) and the operation fails with
//! [`DbError::Cancelled`](crate::db::errors::DbError::Cancelled).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => f.write_str("operation cancelled"),
            Interruption::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Cancellation token plus optional deadline, threaded into every query.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Bind operations to an existing token, e.g. one cancelled on shutdown.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Add a deadline `timeout` from now. An earlier existing deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// A child context: cancelling the parent cancels the child, not vice versa.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The interruption that has already happened, if any.
    pub fn interruption(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            Some(Interruption::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interruption::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Drive `fut` to completion unless the context is interrupted first.
    ///
    /// A context that is already interrupted never polls `fut`.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        if let Some(interruption) = self.interruption() {
            return Err(interruption);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interruption::Cancelled),
            _ = deadline => Err(Interruption::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
