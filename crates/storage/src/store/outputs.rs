#![forbid(unsafe_code)]

use super::*;
use calc_core::ids::CalcId;
use calc_core::model::OutputRecord;
use calc_core::registry::format_output_line;
use rusqlite::OptionalExtension;

const MAX_OUTPUT_KEY_LEN: usize = 128;
const MAX_OUTPUTS_PER_JOB: usize = 256;

fn normalize_output_key(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("output key must not be empty"));
    }
    if trimmed.len() > MAX_OUTPUT_KEY_LEN {
        return Err(StoreError::InvalidInput("output key is too long"));
    }
    Ok(trimmed.to_string())
}

impl SqliteStore {
    pub fn outputs_create(
        &self,
        calc_id: CalcId,
        outputs: &[OutputRecord],
        datastore_size_mb: f64,
    ) -> Result<(), StoreError> {
        if outputs.len() > MAX_OUTPUTS_PER_JOB {
            return Err(StoreError::InvalidInput("too many outputs"));
        }
        let mut conn = self.conn();
        let tx = write_tx(&mut conn)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1",
                params![calc_id.as_i64()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(StoreError::UnknownId(calc_id));
        }

        for output in outputs {
            // Zero-sized outputs are not exposed.
            if output.size_mb == 0.0 {
                continue;
            }
            let key = normalize_output_key(&output.key)?;
            tx.execute(
                r#"
                INSERT INTO outputs(calc_id, key, size_mb) VALUES (?1, ?2, ?3)
                ON CONFLICT(calc_id, key) DO UPDATE SET size_mb=excluded.size_mb
                "#,
                params![calc_id.as_i64(), key, output.size_mb],
            )?;
        }
        tx.execute(
            r#"
            INSERT INTO datastores(calc_id, size_mb) VALUES (?1, ?2)
            ON CONFLICT(calc_id) DO UPDATE SET size_mb=excluded.size_mb
            "#,
            params![calc_id.as_i64(), datastore_size_mb],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn outputs_list(&self, calc_id: CalcId) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT key, size_mb
            FROM outputs
            WHERE calc_id = ?1
            ORDER BY key ASC
            "#,
        )?;
        let rows = stmt.query_map(params![calc_id.as_i64()], |row| {
            Ok(OutputRecord {
                key: row.get(0)?,
                size_mb: row.get(1)?,
            })
        })?;
        let mut lines = Vec::new();
        for output in rows {
            lines.push(format_output_line(calc_id, &output?));
        }
        Ok(lines)
    }
}
