//! Per-operation store metrics.
//!
//! Records, through the `metrics` facade:
//! - `fleetstore_db_operations_total` - Operations completed, labeled by `op` and `outcome`
//! - `fleetstore_db_operation_duration_seconds` - Operation latency, labeled by `op`
//! - `fleetstore_db_merge_rows_total` - Rows reconciled by merge operations, labeled by `op` and
//!   `outcome` (`inserted`, `updated`, `unchanged`)
//!
//! No exporter is installed here; the embedding application chooses one.

use std::time::Duration;

use metrics::{counter, histogram};

use crate::db::errors::{DbError, Op};
use crate::db::merge::MergeTally;

/// Outcome label for an iteration aborted by its callback.
pub(crate) const OUTCOME_ABORTED: &str = "aborted";

pub(crate) fn record_operation(op: Op, outcome: &'static str, elapsed: Duration) {
    counter!("fleetstore_db_operations_total", "op" => op, "outcome" => outcome).increment(1);
    histogram!("fleetstore_db_operation_duration_seconds", "op" => op).record(elapsed.as_secs_f64());
}

pub(crate) fn outcome_of<T>(result: &Result<T, DbError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code().as_str(),
    }
}

pub(crate) fn record_merge(op: Op, tally: &MergeTally) {
    counter!("fleetstore_db_merge_rows_total", "op" => op, "outcome" => "inserted").increment(tally.inserted);
    counter!("fleetstore_db_merge_rows_total", "op" => op, "outcome" => "updated").increment(tally.updated);
    counter!("fleetstore_db_merge_rows_total", "op" => op, "outcome" => "unchanged").increment(tally.unchanged);
}
