//! Read model of the external DMARC aggregate report store.
//!
//! Rows hold already-aggregated category counts per `(domain, period)`, where
//! `period` is the wire form of a [`PeriodKey`]. The rollup only reads from it;
//! [`ReportStore::record`] exists to load exports and fixtures.

use crate::StorageError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracker_core::{normalize_domain, CategoryTotals, PeriodKey, SourceError};

pub const REPORTS_SCHEMA_VERSION: i64 = 1;

/// One line of an aggregate export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub domain: String,
    pub period: PeriodKey,
    #[serde(flatten)]
    pub totals: CategoryTotals,
}

pub struct ReportStore {
    conn: Connection,
}

impl ReportStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > REPORTS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: REPORTS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/reports/0001_aggregate_reports.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn record(
        &self,
        domain: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
    ) -> Result<(), StorageError> {
        let pass = stored_count("pass", totals.pass)?;
        let fail = stored_count("fail", totals.fail)?;
        let pass_dkim_only = stored_count("passDkimOnly", totals.pass_dkim_only)?;
        let pass_spf_only = stored_count("passSpfOnly", totals.pass_spf_only)?;
        self.conn.execute(
            "
            INSERT INTO dmarc_aggregates (
                domain,
                period,
                pass,
                fail,
                pass_dkim_only,
                pass_spf_only
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(domain, period) DO UPDATE SET
                pass=excluded.pass,
                fail=excluded.fail,
                pass_dkim_only=excluded.pass_dkim_only,
                pass_spf_only=excluded.pass_spf_only
            ",
            params![
                normalize_domain(domain),
                period.to_string(),
                pass,
                fail,
                pass_dkim_only,
                pass_spf_only,
            ],
        )?;
        Ok(())
    }

    /// Loads a batch of export rows in one transaction.
    pub fn import(&self, rows: &[AggregateRow]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        for row in rows {
            self.record(&row.domain, &row.period, &row.totals)?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Zero totals when the store holds nothing for the pair.
    pub fn counts_for(&self, domain: &str, period: &PeriodKey) -> Result<CategoryTotals, SourceError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT pass, fail, pass_dkim_only, pass_spf_only
                FROM dmarc_aggregates
                WHERE domain = ?1 AND period = ?2
                ",
                params![normalize_domain(domain), period.to_string()],
                |row| {
                    Ok([
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ])
                },
            )
            .optional()
            .map_err(|err| {
                SourceError::new(format!("counts for {domain} at {period}: {err}"))
            })?;

        let Some([pass, fail, pass_dkim_only, pass_spf_only]) = row else {
            return Ok(CategoryTotals::default());
        };
        let read = |field: &str, value: i64| {
            u64::try_from(value).map_err(|_| {
                SourceError::new(format!(
                    "negative {field} count {value} for {domain} at {period}"
                ))
            })
        };
        Ok(CategoryTotals {
            pass: read("pass", pass)?,
            fail: read("fail", fail)?,
            pass_dkim_only: read("passDkimOnly", pass_dkim_only)?,
            pass_spf_only: read("passSpfOnly", pass_spf_only)?,
        })
    }

    pub fn row_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dmarc_aggregates", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn stored_count(field: &'static str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::CountOutOfRange { field, value })
}
