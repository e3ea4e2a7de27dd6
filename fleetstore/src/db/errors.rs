//! Error taxonomy for store operations and translation of backend failures into it.
//!
//! Store code works in `sqlx` errors and hands them to [`DbError::translate`] together with the
//! operation name and the [`Subject`] being addressed. A step that fails on some other entity,
//! such as a missing parent, attributes its error to that entity with [`Failure::at`].

use crate::db::context::Interruption;
use crate::types::EntityKind;
use thiserror::Error;

/// Name of the store operation that produced an error, e.g. `"clouds.add"`.
pub type Op = &'static str;

/// The closed set of error codes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Store unbound or schema incompatible. Fatal, retrying won't help.
    ServerConfiguration,
    /// A migration is in flight. Transient, retry later.
    UpgradeInProgress,
    NotFound,
    AlreadyExists,
    /// The caller's context was cancelled or its deadline passed.
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ServerConfiguration => "server_configuration",
            ErrorCode::UpgradeInProgress => "upgrade_in_progress",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }
}

/// What an operation was addressing, used to label NotFound and AlreadyExists errors.
///
/// A subject built from an empty key component is invalid: operations on it fail NotFound
/// without reaching storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub entity: EntityKind,
    pub key: String,
    valid: bool,
}

impl Subject {
    /// Subject addressed by a single key component.
    pub fn key(entity: EntityKind, key: impl Into<String>) -> Self {
        let key = key.into();
        let valid = !key.is_empty();
        Self { entity, key, valid }
    }

    /// Subject addressed by a composite key. Every part must be non-empty.
    pub fn composite(entity: EntityKind, parts: &[&str]) -> Self {
        Self {
            entity,
            key: parts.join("/"),
            valid: parts.iter().all(|p| !p.is_empty()),
        }
    }

    /// Subject whose key cannot be empty by construction (UUIDs, row ids, listings).
    pub fn unchecked(entity: EntityKind, key: impl ToString) -> Self {
        Self {
            entity,
            key: key.to_string(),
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Unified error type for store operations.
///
/// No raw `sqlx` error escapes the store: everything is translated into one of these variants,
/// and every variant names the operation that failed.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("{op}: {reason}")]
    ServerConfiguration { op: Op, reason: String },

    #[error("{op}: database upgrade in progress")]
    UpgradeInProgress { op: Op },

    #[error("{op}: {entity} {key:?} not found")]
    NotFound { op: Op, entity: EntityKind, key: String },

    /// `key` is the conflicting value reported by Postgres when it can be extracted, otherwise
    /// the key the operation was addressing.
    #[error("{op}: {entity} {key:?} already exists")]
    AlreadyExists {
        op: Op,
        entity: EntityKind,
        key: String,
        constraint: Option<String>,
    },

    #[error("{op}: {interruption}")]
    Cancelled { op: Op, interruption: Interruption },

    /// Catch-all for non-recoverable errors
    #[error("{op}: {source}")]
    Internal {
        op: Op,
        #[source]
        source: anyhow::Error,
    },
}

impl DbError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::ServerConfiguration { .. } => ErrorCode::ServerConfiguration,
            DbError::UpgradeInProgress { .. } => ErrorCode::UpgradeInProgress,
            DbError::NotFound { .. } => ErrorCode::NotFound,
            DbError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            DbError::Cancelled { .. } => ErrorCode::Cancelled,
            DbError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn op(&self) -> Op {
        match self {
            DbError::ServerConfiguration { op, .. }
            | DbError::UpgradeInProgress { op }
            | DbError::NotFound { op, .. }
            | DbError::AlreadyExists { op, .. }
            | DbError::Cancelled { op, .. }
            | DbError::Internal { op, .. } => *op,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    pub fn not_found(op: Op, subject: &Subject) -> Self {
        DbError::NotFound {
            op,
            entity: subject.entity,
            key: subject.key.clone(),
        }
    }

    pub fn internal(op: Op, source: impl Into<anyhow::Error>) -> Self {
        DbError::Internal {
            op,
            source: source.into(),
        }
    }

    /// Translate a `sqlx` failure into the taxonomy, using `subject` to label key errors.
    pub fn translate(op: Op, subject: &Subject, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::not_found(op, subject),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().map(|s| s.to_string());

                let conflicting_value = db_err
                    .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                    .and_then(|pg_err| pg_err.detail())
                    .and_then(extract_conflicting_value);

                DbError::AlreadyExists {
                    op,
                    entity: subject.entity,
                    key: conflicting_value.unwrap_or_else(|| subject.key.clone()),
                    constraint,
                }
            }
            // Foreign key and check violations land here too
            _ => DbError::internal(op, err),
        }
    }

    /// Translate a migration failure. A ledger that disagrees with the embedded migrations
    /// means the schema belongs to a different build.
    pub fn from_migrate(op: Op, err: sqlx::migrate::MigrateError) -> Self {
        use sqlx::migrate::MigrateError;

        match err {
            MigrateError::VersionMissing(version) => DbError::ServerConfiguration {
                op,
                reason: format!("database schema has migration {version} which this build does not know"),
            },
            MigrateError::VersionMismatch(version) => DbError::ServerConfiguration {
                op,
                reason: format!("migration {version} was previously applied but has been modified"),
            },
            MigrateError::Dirty(version) => DbError::ServerConfiguration {
                op,
                reason: format!("migration {version} is partially applied"),
            },
            other => DbError::internal(op, other),
        }
    }
}

/// A backend failure inside a store operation, optionally attributed to a subject other than
/// the operation's own.
#[derive(Debug)]
pub(crate) struct Failure {
    subject: Option<Subject>,
    source: sqlx::Error,
}

impl Failure {
    /// Attribute an error to `subject`, for use with `map_err`.
    pub(crate) fn at(subject: Subject) -> impl FnOnce(sqlx::Error) -> Failure {
        move |source| Failure {
            subject: Some(subject),
            source,
        }
    }

    /// Translate under the attributed subject, falling back to the operation's `subject`.
    pub(crate) fn translate(self, op: Op, subject: &Subject) -> DbError {
        DbError::translate(op, self.subject.as_ref().unwrap_or(subject), self.source)
    }
}

impl From<sqlx::Error> for Failure {
    fn from(source: sqlx::Error) -> Self {
        Failure { subject: None, source }
    }
}

/// Extract the conflicting value from a PostgreSQL unique violation detail message.
///
/// Details look like `Key (cloud_name, name)=(aws, eu-west-1) already exists.`; composite values
/// are returned as the comma-separated tuple contents.
fn extract_conflicting_value(detail: &str) -> Option<String> {
    let start = detail.find("=(")? + 2;
    let end = detail[start..].rfind(')')? + start;
    Some(detail[start..end].to_string())
}

/// Type alias for database operation results
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_conflicting_value() {
        assert_eq!(
            extract_conflicting_value("Key (name)=(test-cloud) already exists."),
            Some("test-cloud".to_string())
        );
        assert_eq!(
            extract_conflicting_value("Key (cloud_name, name)=(aws, eu-west-1) already exists."),
            Some("aws, eu-west-1".to_string())
        );
        assert_eq!(extract_conflicting_value("something else entirely"), None);
    }

    #[test]
    fn test_row_not_found_names_subject() {
        let subject = Subject::key(EntityKind::Cloud, "missing");
        let err = DbError::translate("clouds.get", &subject, sqlx::Error::RowNotFound);

        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.op(), "clouds.get");
        assert_eq!(err.to_string(), r#"clouds.get: cloud "missing" not found"#);
    }

    #[test]
    fn test_failure_attributed_to_parent() {
        let controller = Subject::key(EntityKind::Controller, "c1");

        let region = Subject::composite(EntityKind::CloudRegion, &["aws", "nowhere"]);
        let err = Failure::at(region)(sqlx::Error::RowNotFound).translate("controllers.add", &controller);
        assert!(matches!(
            &err,
            DbError::NotFound { entity: EntityKind::CloudRegion, key, .. } if key == "aws/nowhere"
        ));
        assert_eq!(err.op(), "controllers.add");

        let err = Failure::from(sqlx::Error::RowNotFound).translate("controllers.get", &controller);
        assert!(matches!(
            &err,
            DbError::NotFound { entity: EntityKind::Controller, key, .. } if key == "c1"
        ));
    }

    #[test]
    fn test_unrecognised_errors_are_internal() {
        let subject = Subject::key(EntityKind::Controller, "c1");
        let err = DbError::translate("controllers.add", &subject, sqlx::Error::PoolTimedOut);
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().starts_with("controllers.add: "));
    }

    #[test]
    fn test_subject_validity() {
        assert!(Subject::key(EntityKind::Identity, "bob@example.com").is_valid());
        assert!(!Subject::key(EntityKind::Identity, "").is_valid());
        assert!(!Subject::composite(EntityKind::CloudRegion, &["aws", ""]).is_valid());
        assert!(Subject::composite(EntityKind::CloudRegion, &["aws", "eu-west-1"]).is_valid());
        assert_eq!(Subject::composite(EntityKind::CloudRegion, &["aws", "eu-west-1"]).key, "aws/eu-west-1");
    }

    #[test]
    fn test_migrate_ledger_mismatch_is_server_configuration() {
        let err = DbError::from_migrate("database.migrate", sqlx::migrate::MigrateError::VersionMissing(1));
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);

        let err = DbError::from_migrate("database.migrate", sqlx::migrate::MigrateError::VersionMismatch(1));
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
    }
}
