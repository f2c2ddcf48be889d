//! Job store operations: enqueue, atomic claim, ack, and reclaim of orphans.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use regex::Regex;
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{InstanceToken, Job, JobId, JobStatus, NewJob, WorkerToken};
use crate::telemetry::metrics;

/// Module names are restricted to this alphabet before they reach any query.
static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_ ().\-]{1,64}$").expect("module name pattern is valid")
});

/// Reject module names outside the allow-list.
pub fn validate_module_name(name: &str) -> Result<()> {
    if MODULE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid module name: {name:?}")))
    }
}

impl super::Db {
    /// Insert a new `Scheduled` job. Never deduplicates.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        validate_module_name(&new.module_name)?;

        let id = JobId::new();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, '', ?7, ?7)",
        )
        .bind(id.as_str())
        .bind(&new.case_id)
        .bind(&new.evidence_id)
        .bind(&new.module_name)
        .bind(JobStatus::Scheduled.as_str())
        .bind(self.instance_token().as_str())
        .bind(now)
        .execute(self.pool())
        .await?;

        metrics::jobs_enqueued().add(1, &[KeyValue::new("module", new.module_name.clone())]);
        debug!(job = %id, module = %new.module_name, evidence = %new.evidence_id, "job enqueued");

        self.get_job(&id).await
    }

    /// Claim the oldest `Scheduled` job whose module is in `modules`.
    ///
    /// The select and the update are one statement, so two concurrent
    /// claimers can never both receive the same job. Returns `None` when
    /// nothing matches.
    pub async fn claim_next(
        &self,
        worker: &WorkerToken,
        modules: &[String],
    ) -> Result<Option<Job>> {
        for name in modules {
            validate_module_name(name)?;
        }
        if modules.is_empty() {
            return Ok(None);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE jobs SET status = ");
        query
            .push_bind(JobStatus::Running.as_str())
            .push(", worker_token = ")
            .push_bind(worker.as_str())
            .push(", server_token = ")
            .push_bind(self.instance_token().as_str())
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE rowid = (SELECT min(rowid) FROM jobs WHERE status = ")
            .push_bind(JobStatus::Scheduled.as_str())
            .push(" AND name IN (");
        let mut names = query.separated(", ");
        for name in modules {
            names.push_bind(name.as_str());
        }
        names.push_unseparated(")) AND status = ");
        query
            .push_bind(JobStatus::Scheduled.as_str())
            .push(
                " RETURNING id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at",
            );

        let row: Option<JobRow> = query.build_query_as().fetch_optional(self.pool()).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = row.try_into_job()?;

        metrics::jobs_claimed().add(1, &[KeyValue::new("module", job.module_name.clone())]);
        Ok(Some(job))
    }

    /// Move a `Running` job to `Success` or `Failed`.
    ///
    /// Returns `false` without touching the row when the job is not running,
    /// which makes duplicate acks harmless. A successful ack clears `error`.
    pub async fn ack(&self, id: &JobId, status: JobStatus, error: &str) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "ack status must be Success or Failed, got {status}"
            )));
        }
        let error = if status == JobStatus::Success { "" } else { error };

        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        let applied = rows_affected > 0;
        metrics::jobs_acked().add(
            1,
            &[
                KeyValue::new("status", status.as_str()),
                KeyValue::new("result", if applied { "applied" } else { "ignored" }),
            ],
        );
        if !applied {
            debug!(job = %id, %status, "ack ignored, job is not running");
        }
        Ok(applied)
    }

    /// Reschedule every job running under `worker`. Called when its
    /// connection closes.
    pub async fn release_worker_jobs(&self, worker: &WorkerToken) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE jobs SET status = ?1, worker_token = '', updated_at = ?2
             WHERE worker_token = ?3 AND status = ?4",
        )
        .bind(JobStatus::Scheduled.as_str())
        .bind(Utc::now())
        .bind(worker.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        if released > 0 {
            metrics::jobs_released().add(released, &[KeyValue::new("reason", "disconnect")]);
        }
        Ok(released)
    }

    /// Reschedule every job running under a server instance other than
    /// `current`. Called once at startup, before workers connect.
    pub async fn release_stale_server_jobs(&self, current: &InstanceToken) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE jobs SET status = ?1, server_token = ?2, worker_token = '', updated_at = ?3
             WHERE server_token != ?2 AND status = ?4",
        )
        .bind(JobStatus::Scheduled.as_str())
        .bind(current.as_str())
        .bind(Utc::now())
        .bind(JobStatus::Running.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        if released > 0 {
            metrics::jobs_released().add(released, &[KeyValue::new("reason", "stale_server")]);
        }
        Ok(released)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at
             FROM jobs WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// All jobs for an evidence item, oldest first.
    pub async fn list_jobs(&self, evidence_id: &str) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at
             FROM jobs WHERE evidence_id = ?1 ORDER BY rowid ASC",
        )
        .bind(evidence_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Jobs in the given status (any status when `None`), oldest first.
    pub async fn list_jobs_by_status(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at
             FROM jobs WHERE ?1 IS NULL OR status = ?1 ORDER BY rowid ASC LIMIT ?2",
        )
        .bind(status.map(JobStatus::as_str))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Jobs whose id starts with `prefix`, at most `limit` of them.
    pub async fn find_jobs_by_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Job>> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("invalid job id prefix: {prefix:?}")));
        }
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, case_id, evidence_id, name, status, error, server_token, worker_token, created_at, updated_at
             FROM jobs WHERE substr(id, 1, length(?1)) = ?1 ORDER BY rowid ASC LIMIT ?2",
        )
        .bind(prefix)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    case_id: String,
    evidence_id: String,
    name: String,
    status: String,
    error: String,
    server_token: String,
    worker_token: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            case_id: self.case_id,
            evidence_id: self.evidence_id,
            module_name: self.name,
            status: self.status.parse()?,
            error: self.error,
            server_token: self.server_token,
            worker_token: self.worker_token,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_allowed() {
        for name in [
            "Hayabusa",
            "Plaso (Windows Preset)",
            "Plaso (Filesystem Timeline)",
            "Timesketch Importer",
            "custom_module-2.1",
        ] {
            assert!(validate_module_name(name).is_ok(), "{name} should be allowed");
        }
    }

    #[test]
    fn injection_attempts_are_rejected() {
        for name in [
            "; DROP TABLE jobs",
            "Hayabusa'; --",
            "a\"b",
            "",
            "line\nbreak",
        ] {
            assert!(
                matches!(validate_module_name(name), Err(Error::Validation(_))),
                "{name:?} should be rejected"
            );
        }
    }
}
