//! Case, evidence and hook rows.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Case, Evidence, Hook};

impl super::Db {
    /// Insert or update a case.
    pub async fn save_case(&self, case: &Case) -> Result<()> {
        sqlx::query(
            "INSERT INTO cases (id, name, sketch_id) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name, sketch_id = excluded.sketch_id",
        )
        .bind(&case.id)
        .bind(&case.name)
        .bind(case.sketch_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_case(&self, id: &str) -> Result<Case> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT id, name, sketch_id FROM cases WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        let (id, name, sketch_id) = row.ok_or_else(|| Error::NotFound(format!("case {id}")))?;
        Ok(Case {
            id,
            name,
            sketch_id,
        })
    }

    /// Insert or update an evidence item. An id already owned by another
    /// case is rejected; evidence never moves between cases.
    pub async fn save_evidence(&self, evidence: &Evidence) -> Result<()> {
        let written = sqlx::query(
            "INSERT INTO evidences (id, case_id, type, name, source, notes, size, hash, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (id) DO UPDATE SET
                type = excluded.type, name = excluded.name,
                source = excluded.source, notes = excluded.notes, size = excluded.size,
                hash = excluded.hash
             WHERE evidences.case_id = excluded.case_id",
        )
        .bind(&evidence.id)
        .bind(&evidence.case_id)
        .bind(&evidence.kind)
        .bind(&evidence.name)
        .bind(&evidence.source)
        .bind(&evidence.notes)
        .bind(evidence.size)
        .bind(&evidence.hash)
        .bind(evidence.added_at)
        .execute(self.pool())
        .await?
        .rows_affected();

        if written == 0 {
            return Err(Error::Validation(format!(
                "evidence {} belongs to another case",
                evidence.id
            )));
        }
        Ok(())
    }

    /// Get an evidence item scoped to its case.
    pub async fn get_evidence(&self, case_id: &str, id: &str) -> Result<Evidence> {
        let row: Option<EvidenceRow> = sqlx::query_as(
            "SELECT id, case_id, type, name, source, notes, size, hash, added_at
             FROM evidences WHERE case_id = ?1 AND id = ?2",
        )
        .bind(case_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(Evidence::from)
            .ok_or_else(|| Error::NotFound(format!("evidence {id} in case {case_id}")))
    }

    pub async fn list_hooks(&self) -> Result<Vec<Hook>> {
        let rows: Vec<HookRow> = sqlx::query_as(
            "SELECT id, trigger, name, module, condition, enabled FROM hooks ORDER BY name ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(HookRow::try_into_hook).collect()
    }

    /// Insert or update a hook.
    pub async fn save_hook(&self, hook: &Hook) -> Result<()> {
        sqlx::query(
            "INSERT INTO hooks (id, trigger, name, module, condition, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                trigger = excluded.trigger, name = excluded.name, module = excluded.module,
                condition = excluded.condition, enabled = excluded.enabled",
        )
        .bind(&hook.id)
        .bind(hook.trigger.as_str())
        .bind(&hook.name)
        .bind(&hook.module)
        .bind(&hook.condition)
        .bind(hook.enabled)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_hook(&self, id: &str) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM hooks WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("hook {id}")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EvidenceRow {
    id: String,
    case_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    name: String,
    source: String,
    notes: String,
    size: i64,
    hash: String,
    added_at: DateTime<Utc>,
}

impl From<EvidenceRow> for Evidence {
    fn from(row: EvidenceRow) -> Self {
        Evidence {
            id: row.id,
            case_id: row.case_id,
            kind: row.kind,
            name: row.name,
            source: row.source,
            notes: row.notes,
            size: row.size,
            hash: row.hash,
            added_at: row.added_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HookRow {
    id: String,
    trigger: String,
    name: String,
    module: String,
    condition: String,
    enabled: bool,
}

impl HookRow {
    fn try_into_hook(self) -> Result<Hook> {
        Ok(Hook {
            id: self.id,
            trigger: self.trigger.parse()?,
            name: self.name,
            module: self.module,
            condition: self.condition,
            enabled: self.enabled,
        })
    }
}
