use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use thiserror::Error;
use tracker_core::{
    normalize_domain, CategoryPercentages, CategoryTotals, PeriodKey, Summary, ValidationError,
};
use uuid::Uuid;

pub mod reports;

pub use reports::{AggregateRow, ReportStore, REPORTS_SCHEMA_VERSION};

pub const GRAPH_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("stored period is invalid: {0}")]
    InvalidPeriod(#[from] ValidationError),
    #[error("unknown domain key: {0}")]
    MissingDomain(String),
    #[error("{field} count {value} does not fit a stored integer")]
    CountOutOfRange { field: &'static str, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub key: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrganization {
    pub acronym_en: String,
    pub acronym_fr: String,
    pub name_en: Option<String>,
    pub name_fr: Option<String>,
}

/// Persistence of summary snapshots and their dated `domain -> summary` edges.
///
/// Every operation is safe to repeat: a (domain, period) pair never gets a
/// second edge, and removing an absent period is a no-op.
pub trait SummaryStore {
    fn create_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError>;

    fn upsert_current_period(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError>;

    /// Removes `period_to_remove` then creates `period_to_add`.
    fn roll_window(
        &self,
        domain_key: &str,
        period_to_remove: &PeriodKey,
        period_to_add: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError>;

    /// Returns whether anything was removed.
    fn remove_edge_and_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
    ) -> Result<bool, StorageError>;
}

pub struct GraphStore {
    conn: Connection,
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > GRAPH_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: GRAPH_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_graph_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_ownership.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn upsert_domain(&self, domain: &str) -> Result<String, StorageError> {
        let domain = normalize_domain(domain);
        self.conn.execute(
            "INSERT OR IGNORE INTO domains (key, domain) VALUES (?1, ?2)",
            params![new_key(), domain],
        )?;
        Ok(self.conn.query_row(
            "SELECT key FROM domains WHERE domain = ?1",
            [domain],
            |row| row.get(0),
        )?)
    }

    pub fn domain_key(&self, domain: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT key FROM domains WHERE domain = ?1",
                [normalize_domain(domain)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn list_domains(&self) -> Result<Vec<DomainRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, domain FROM domains ORDER BY domain ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainRecord {
                key: row.get(0)?,
                domain: row.get(1)?,
            })
        })?;

        let mut domains = Vec::new();
        for row in rows {
            domains.push(row?);
        }
        Ok(domains)
    }

    pub fn upsert_organization(&self, org: &NewOrganization) -> Result<String, StorageError> {
        self.conn.execute(
            "
            INSERT INTO organizations (key, acronym_en, acronym_fr, name_en, name_fr)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(acronym_en) DO UPDATE SET
                acronym_fr=excluded.acronym_fr,
                name_en=excluded.name_en,
                name_fr=excluded.name_fr
            ",
            params![
                new_key(),
                org.acronym_en.trim().to_uppercase(),
                org.acronym_fr.trim().to_uppercase(),
                org.name_en,
                org.name_fr,
            ],
        )?;
        Ok(self.conn.query_row(
            "SELECT key FROM organizations WHERE acronym_en = ?1",
            [org.acronym_en.trim().to_uppercase()],
            |row| row.get(0),
        )?)
    }

    /// Matches either the English or the French acronym.
    pub fn organization_key_by_acronym(
        &self,
        acronym: &str,
    ) -> Result<Option<String>, StorageError> {
        let acronym = acronym.trim().to_uppercase();
        Ok(self
            .conn
            .query_row(
                "
                SELECT key FROM organizations
                WHERE acronym_en = ?1 OR acronym_fr = ?1
                ORDER BY CASE WHEN acronym_en = ?1 THEN 0 ELSE 1 END, key
                LIMIT 1
                ",
                [acronym],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// One ownership edge per domain; a new owner replaces the previous one.
    pub fn upsert_ownership(&self, org_key: &str, domain_key: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO ownership (key, from_key, to_key) VALUES (?1, ?2, ?3)
            ON CONFLICT(to_key) DO UPDATE SET from_key=excluded.from_key
            ",
            params![new_key(), org_key, domain_key],
        )?;
        Ok(())
    }

    pub fn owner_of(&self, domain_key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT from_key FROM ownership WHERE to_key = ?1",
                [domain_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn ownership_edge_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ownership", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Periods the domain currently has summary edges for, months oldest first
    /// and `thirtyDays` last.
    pub fn known_periods(&self, domain_key: &str) -> Result<Vec<PeriodKey>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT start_date FROM domains_to_summaries WHERE from_key = ?1")?;
        let rows = stmt.query_map([domain_key], |row| row.get::<_, String>(0))?;

        let mut periods = Vec::new();
        for row in rows {
            periods.push(row?.parse::<PeriodKey>()?);
        }
        periods.sort();
        Ok(periods)
    }

    pub fn summary_for(
        &self,
        domain_key: &str,
        period: &PeriodKey,
    ) -> Result<Option<Summary>, StorageError> {
        let document = self
            .conn
            .query_row(
                "
                SELECT s.document_json
                FROM domains_to_summaries e
                JOIN summaries s ON s.key = e.to_key
                WHERE e.from_key = ?1 AND e.start_date = ?2
                ",
                params![domain_key, period.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        document.map(|raw| decode_summary(&raw)).transpose()
    }

    pub fn summaries_for(&self, domain_key: &str) -> Result<Vec<Summary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT s.document_json
            FROM domains_to_summaries e
            JOIN summaries s ON s.key = e.to_key
            WHERE e.from_key = ?1
            ",
        )?;
        let rows = stmt.query_map([domain_key], |row| row.get::<_, String>(0))?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(decode_summary(&row?)?);
        }
        summaries.sort_by_key(|summary| summary.start_date);
        Ok(summaries)
    }

    pub fn summary_edge_count(&self, domain_key: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM domains_to_summaries WHERE from_key = ?1",
            [domain_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn summary_document_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM summaries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn write_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        ensure_domain(&tx, domain_key)?;

        let summary = Summary {
            domain_key: domain_key.to_string(),
            start_date: *period,
            category_totals: *totals,
            category_percentages: *percentages,
            total_messages: totals.total_messages(),
        };
        let document_json = serde_json::to_string(&summary)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let existing = summary_key_for(&tx, domain_key, period)?;
        let summary_key = match existing {
            Some(summary_key) => {
                tx.execute(
                    "UPDATE summaries SET document_json = ?2 WHERE key = ?1",
                    params![summary_key, document_json],
                )?;
                summary_key
            }
            None => {
                let summary_key = new_key();
                tx.execute(
                    "INSERT INTO summaries (key, document_json) VALUES (?1, ?2)",
                    params![summary_key, document_json],
                )?;
                tx.execute(
                    "
                    INSERT INTO domains_to_summaries (key, from_key, to_key, start_date)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![new_key(), domain_key, summary_key, period.to_string()],
                )?;
                summary_key
            }
        };

        tx.commit()?;
        Ok(summary_key)
    }
}

impl SummaryStore for GraphStore {
    fn create_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        self.write_snapshot(domain_key, period, totals, percentages)
    }

    fn upsert_current_period(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        self.write_snapshot(domain_key, period, totals, percentages)
    }

    fn roll_window(
        &self,
        domain_key: &str,
        period_to_remove: &PeriodKey,
        period_to_add: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        self.remove_edge_and_snapshot(domain_key, period_to_remove)?;
        self.write_snapshot(domain_key, period_to_add, totals, percentages)
    }

    fn remove_edge_and_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
    ) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(summary_key) = summary_key_for(&tx, domain_key, period)? else {
            return Ok(false);
        };

        tx.execute(
            "DELETE FROM domains_to_summaries WHERE from_key = ?1 AND start_date = ?2",
            params![domain_key, period.to_string()],
        )?;
        tx.execute("DELETE FROM summaries WHERE key = ?1", [summary_key])?;
        tx.commit()?;
        Ok(true)
    }
}

fn ensure_domain(tx: &Transaction<'_>, domain_key: &str) -> Result<(), StorageError> {
    let found = tx
        .query_row("SELECT 1 FROM domains WHERE key = ?1", [domain_key], |_| {
            Ok(())
        })
        .optional()?;
    match found {
        Some(()) => Ok(()),
        None => Err(StorageError::MissingDomain(domain_key.to_string())),
    }
}

fn summary_key_for(
    tx: &Transaction<'_>,
    domain_key: &str,
    period: &PeriodKey,
) -> Result<Option<String>, StorageError> {
    Ok(tx
        .query_row(
            "SELECT to_key FROM domains_to_summaries WHERE from_key = ?1 AND start_date = ?2",
            params![domain_key, period.to_string()],
            |row| row.get(0),
        )
        .optional()?)
}

fn decode_summary(raw: &str) -> Result<Summary, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn new_key() -> String {
    Uuid::new_v4().simple().to_string()
}
