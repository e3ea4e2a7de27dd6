//! Lifecycle gate checked at the start of every store operation.
//!
//! ```text
//! Unconfigured ──migrate()──> Migrating ──ok──> Ready
//!                                 │
//!                                 └──err──> Failed (reported as Unconfigured)
//! ```
//!
//! The state only ever moves forward. A store whose migration failed stays unusable; the
//! bootstrap tool has to construct a new [`Database`](crate::db::Database) to try again.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::db::errors::{DbError, Op, Result};

const UNCONFIGURED: u8 = 0;
const MIGRATING: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessState {
    Unconfigured,
    Migrating,
    Ready,
}

/// What a caller of [`ReadinessGuard::begin_migration`] should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MigrationStart {
    /// The caller owns the migration and must call `finish_migration`.
    Started,
    /// Already migrated.
    AlreadyReady,
}

#[derive(Debug)]
pub struct ReadinessGuard {
    bound: bool,
    state: AtomicU8,
}

impl ReadinessGuard {
    /// `bound` records whether a connection pool is attached at all.
    pub(crate) fn new(bound: bool) -> Self {
        Self {
            bound,
            state: AtomicU8::new(UNCONFIGURED),
        }
    }

    pub fn state(&self) -> ReadinessState {
        match self.state.load(Ordering::Acquire) {
            MIGRATING => ReadinessState::Migrating,
            READY => ReadinessState::Ready,
            _ => ReadinessState::Unconfigured,
        }
    }

    /// Fail unless the store is ready for data operations.
    pub fn check(&self, op: Op) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            READY => Ok(()),
            MIGRATING => Err(DbError::UpgradeInProgress { op }),
            FAILED => Err(DbError::ServerConfiguration {
                op,
                reason: "database migration failed".to_string(),
            }),
            _ if !self.bound => Err(DbError::ServerConfiguration {
                op,
                reason: "database not configured".to_string(),
            }),
            _ => Err(DbError::ServerConfiguration {
                op,
                reason: "database not migrated".to_string(),
            }),
        }
    }

    /// Claim the single Unconfigured -> Migrating transition.
    pub(crate) fn begin_migration(&self, op: Op) -> Result<MigrationStart> {
        if !self.bound {
            return Err(DbError::ServerConfiguration {
                op,
                reason: "database not configured".to_string(),
            });
        }

        match self
            .state
            .compare_exchange(UNCONFIGURED, MIGRATING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(MigrationStart::Started),
            Err(READY) => Ok(MigrationStart::AlreadyReady),
            Err(MIGRATING) => Err(DbError::UpgradeInProgress { op }),
            Err(_) => Err(DbError::ServerConfiguration {
                op,
                reason: "database migration failed".to_string(),
            }),
        }
    }

    pub(crate) fn finish_migration(&self, succeeded: bool) {
        let next = if succeeded { READY } else { FAILED };
        self.state.store(next, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ReadinessState) {
        let raw = match state {
            ReadinessState::Unconfigured => UNCONFIGURED,
            ReadinessState::Migrating => MIGRATING,
            ReadinessState::Ready => READY,
        };
        self.state.store(raw, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::errors::ErrorCode;

    #[test]
    fn test_unbound_store_rejects_everything() {
        let guard = ReadinessGuard::new(false);
        assert_eq!(guard.state(), ReadinessState::Unconfigured);

        let err = guard.check("clouds.get").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
        assert_eq!(err.op(), "clouds.get");

        let err = guard.begin_migration("database.migrate").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
    }

    #[test]
    fn test_lifecycle_moves_forward_once() {
        let guard = ReadinessGuard::new(true);
        assert_eq!(guard.check("x").unwrap_err().code(), ErrorCode::ServerConfiguration);

        assert_eq!(guard.begin_migration("database.migrate").unwrap(), MigrationStart::Started);
        assert_eq!(guard.state(), ReadinessState::Migrating);
        assert_eq!(guard.check("x").unwrap_err().code(), ErrorCode::UpgradeInProgress);
        assert_eq!(
            guard.begin_migration("database.migrate").unwrap_err().code(),
            ErrorCode::UpgradeInProgress
        );

        guard.finish_migration(true);
        assert_eq!(guard.state(), ReadinessState::Ready);
        assert!(guard.check("x").is_ok());
        assert_eq!(
            guard.begin_migration("database.migrate").unwrap(),
            MigrationStart::AlreadyReady
        );
    }

    #[test]
    fn test_failed_migration_is_terminal() {
        let guard = ReadinessGuard::new(true);
        guard.begin_migration("database.migrate").unwrap();
        guard.finish_migration(false);

        assert_eq!(guard.state(), ReadinessState::Unconfigured);
        assert_eq!(guard.check("x").unwrap_err().code(), ErrorCode::ServerConfiguration);
        assert_eq!(
            guard.begin_migration("database.migrate").unwrap_err().code(),
            ErrorCode::ServerConfiguration
        );
    }
}
