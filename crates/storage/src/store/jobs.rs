#![forbid(unsafe_code)]

use super::*;
use calc_core::ids::CalcId;
use calc_core::model::{
    Job, JobFilter, JobStatus, JobUpdate, NewJob, OutputRecord, TerminalStatus,
};
use calc_core::{JobRegistry, RegistryError};
use rusqlite::{OptionalExtension, Transaction, params_from_iter};

const MAX_DESCRIPTION_LEN: usize = 400;
const JOB_COLUMNS: &str = "id, status, pid, parent_id, is_array_member, description, params_json, \
     log_file, created_at_ms, updated_at_ms, completed_at_ms";

struct RawJob {
    id: i64,
    status: String,
    pid: i64,
    parent_id: Option<i64>,
    is_array_member: bool,
    description: String,
    params_json: String,
    log_file: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    completed_at_ms: Option<i64>,
}

impl RawJob {
    fn read(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            pid: row.get(2)?,
            parent_id: row.get(3)?,
            is_array_member: row.get(4)?,
            description: row.get(5)?,
            params_json: row.get(6)?,
            log_file: row.get(7)?,
            created_at_ms: row.get(8)?,
            updated_at_ms: row.get(9)?,
            completed_at_ms: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let id = self.id;
        let corrupt = |column| StoreError::CorruptRow {
            calc_id: id,
            column,
        };
        let calc_id = CalcId::try_new(self.id).map_err(|_| corrupt("id"))?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| corrupt("status"))?;
        let pid = u32::try_from(self.pid).map_err(|_| corrupt("pid"))?;
        let parent_id = match self.parent_id {
            Some(raw) => Some(CalcId::try_new(raw).map_err(|_| corrupt("parent_id"))?),
            None => None,
        };
        Ok(Job {
            calc_id,
            status,
            pid,
            parent_id,
            is_array_member: self.is_array_member,
            description: self.description,
            params_json: self.params_json,
            log_file: self.log_file,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            completed_at_ms: self.completed_at_ms,
        })
    }
}

fn normalize_description(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "calculation".to_string();
    }
    trimmed.chars().take(MAX_DESCRIPTION_LEN).collect()
}

fn status_tx(tx: &Transaction<'_>, calc_id: CalcId) -> Result<JobStatus, StoreError> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            params![calc_id.as_i64()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Err(StoreError::UnknownId(calc_id));
    };
    JobStatus::parse(&raw).ok_or(StoreError::CorruptRow {
        calc_id: calc_id.as_i64(),
        column: "status",
    })
}

fn set_status_tx(
    tx: &Transaction<'_>,
    calc_id: CalcId,
    status: JobStatus,
    now_ms: i64,
) -> Result<(), StoreError> {
    let completed_at_ms = status.is_terminal().then_some(now_ms);
    tx.execute(
        r#"
        UPDATE jobs
        SET status = ?2, updated_at_ms = ?3, completed_at_ms = COALESCE(?4, completed_at_ms)
        WHERE id = ?1
        "#,
        params![calc_id.as_i64(), status.as_str(), now_ms, completed_at_ms],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn job_create(&self, request: NewJob) -> Result<CalcId, StoreError> {
        if request.params_json.trim().is_empty() {
            return Err(StoreError::InvalidInput("job params must not be empty"));
        }
        let now_ms = now_ms();
        let mut conn = self.conn();
        let tx = write_tx(&mut conn)?;

        if let Some(parent) = request.parent_id {
            status_tx(&tx, parent)?;
        }

        tx.execute(
            r#"
            INSERT INTO jobs(
              status, pid, parent_id, is_array_member, description, params_json, log_file,
              created_at_ms, updated_at_ms, completed_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                JobStatus::Created.as_str(),
                0i64,
                request.parent_id.map(CalcId::as_i64),
                request.is_array_member,
                normalize_description(&request.description),
                request.params_json,
                request.log_file,
                now_ms,
                now_ms,
                Option::<i64>::None,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        CalcId::try_new(id).map_err(|_| StoreError::CorruptRow {
            calc_id: id,
            column: "id",
        })
    }

    pub fn job_update(&self, calc_id: CalcId, update: JobUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Err(StoreError::InvalidInput("no fields to update"));
        }
        let now_ms = now_ms();
        let mut conn = self.conn();
        let tx = write_tx(&mut conn)?;

        let current = status_tx(&tx, calc_id)?;
        if let Some(next) = update.status {
            if !current.can_advance_to(next) {
                return Err(StoreError::InvalidTransition {
                    calc_id,
                    from: current,
                    to: next,
                });
            }
            set_status_tx(&tx, calc_id, next, now_ms)?;
        }
        if let Some(pid) = update.pid {
            tx.execute(
                "UPDATE jobs SET pid = ?2, updated_at_ms = ?3 WHERE id = ?1",
                params![calc_id.as_i64(), i64::from(pid), now_ms],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn job_finish(&self, calc_id: CalcId, outcome: TerminalStatus) -> Result<(), StoreError> {
        let now_ms = now_ms();
        let mut conn = self.conn();
        let tx = write_tx(&mut conn)?;

        let current = status_tx(&tx, calc_id)?;
        if current.is_terminal() {
            // Idempotent: the first terminal status wins.
            tx.commit()?;
            return Ok(());
        }
        let next = outcome.status();
        if !current.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                calc_id,
                from: current,
                to: next,
            });
        }
        set_status_tx(&tx, calc_id, next, now_ms)?;

        tx.commit()?;
        Ok(())
    }

    pub fn job_get(&self, calc_id: CalcId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![calc_id.as_i64()],
                RawJob::read,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    pub fn jobs_query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut clauses = Vec::<String>::new();
        let mut values = Vec::<rusqlite::types::Value>::new();

        if !filter.statuses.is_empty() {
            let placeholders = filter
                .statuses
                .iter()
                .map(|status| {
                    values.push(rusqlite::types::Value::Text(status.as_str().to_string()));
                    format!("?{}", values.len())
                })
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("status IN ({placeholders})"));
        }
        if let Some(floor) = filter.id_below {
            let floor = i64::try_from(floor).unwrap_or(i64::MAX);
            values.push(rusqlite::types::Value::Integer(floor));
            clauses.push(format!("id < ?{}", values.len()));
        }
        if filter.require_pid {
            clauses.push("pid > 0".to_string());
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            values.push(rusqlite::types::Value::Integer(to_sqlite_i64(limit)?));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), RawJob::read)?;
        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(raw?.into_job()?);
        }
        Ok(jobs)
    }

    /// Newest jobs first.
    pub fn jobs_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![to_sqlite_i64(limit)?], RawJob::read)?;
        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(raw?.into_job()?);
        }
        Ok(jobs)
    }
}

impl JobRegistry for SqliteStore {
    fn create(&self, job: NewJob) -> Result<CalcId, RegistryError> {
        Ok(self.job_create(job)?)
    }

    fn update(&self, calc_id: CalcId, update: JobUpdate) -> Result<(), RegistryError> {
        Ok(self.job_update(calc_id, update)?)
    }

    fn get(&self, calc_id: CalcId) -> Result<Option<Job>, RegistryError> {
        Ok(self.job_get(calc_id)?)
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError> {
        Ok(self.jobs_query(filter)?)
    }

    fn finish(&self, calc_id: CalcId, outcome: TerminalStatus) -> Result<(), RegistryError> {
        Ok(self.job_finish(calc_id, outcome)?)
    }

    fn create_outputs(
        &self,
        calc_id: CalcId,
        outputs: &[OutputRecord],
        datastore_size_mb: f64,
    ) -> Result<(), RegistryError> {
        Ok(self.outputs_create(calc_id, outputs, datastore_size_mb)?)
    }

    fn list_outputs(&self, calc_id: CalcId) -> Result<Vec<String>, RegistryError> {
        Ok(self.outputs_list(calc_id)?)
    }
}
