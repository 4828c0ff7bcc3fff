//! Staging-table shapes and `COPY ... FROM STDIN` text encoding for bulk replication.

use chrono::{DateTime, SecondsFormat, Utc};
use qbank_core::{Company, CompanyProblem, Problem, ProblemTag};
use sqlx::postgres::PgRow;
use sqlx::FromRow;

/// Shape of one replicated table: column order is shared by the source
/// select, the staging `COPY` and the destination upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub key: &'static [&'static str],
    /// Column backed by a store-assigned sequence, if any.
    pub serial_column: Option<&'static str>,
}

pub const COMPANIES: TableSpec = TableSpec {
    name: "companies",
    columns: &["id", "name"],
    key: &["id"],
    serial_column: Some("id"),
};

pub const PROBLEMS: TableSpec = TableSpec {
    name: "problems",
    columns: &[
        "id",
        "url",
        "title",
        "difficulty",
        "acceptance",
        "frequency",
        "updated_at",
    ],
    key: &["id"],
    serial_column: None,
};

pub const PROBLEM_TAGS: TableSpec = TableSpec {
    name: "problem_tags",
    columns: &["problem_id", "tag", "added_at"],
    key: &["problem_id", "tag"],
    serial_column: None,
};

pub const COMPANY_PROBLEMS: TableSpec = TableSpec {
    name: "company_problems",
    columns: &[
        "company_id",
        "problem_id",
        "source_file",
        "timeframe_tag",
        "last_seen",
    ],
    key: &["company_id", "problem_id"],
    serial_column: None,
};

impl TableSpec {
    pub fn staging_name(&self) -> String {
        format!("staging_{}", self.name)
    }

    fn column_list(&self) -> String {
        self.columns.join(", ")
    }

    /// Transaction-scoped staging table with the destination's column types.
    pub fn create_staging_sql(&self) -> String {
        format!(
            "CREATE TEMP TABLE {} (LIKE {}) ON COMMIT DROP",
            self.staging_name(),
            self.name
        )
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.column_list(),
            self.name,
            self.key.join(", ")
        )
    }

    pub fn copy_in_sql(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN",
            self.staging_name(),
            self.column_list()
        )
    }

    /// `INSERT .. SELECT` from staging that overwrites every non-key column on conflict.
    pub fn upsert_sql(&self) -> String {
        let updates = self
            .columns
            .iter()
            .filter(|column| !self.key.contains(column))
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect::<Vec<_>>();
        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM {staging} ON CONFLICT ({key}) {conflict_action}",
            table = self.name,
            columns = self.column_list(),
            staging = self.staging_name(),
            key = self.key.join(", "),
        )
    }

    /// Moves the sequence so the next generated value is `max(existing, 0) + 1`.
    pub fn sequence_repair_sql(&self) -> Option<String> {
        let column = self.serial_column?;
        Some(format!(
            "SELECT setval(pg_get_serial_sequence('{table}', '{column}'), \
             GREATEST(COALESCE(MAX({column}), 0), 1), MAX({column}) IS NOT NULL) FROM {table}",
            table = self.name,
        ))
    }
}

/// Writes one row of Postgres `COPY` text format: tab separated, `\N` for NULL.
pub struct CopyLine<'a> {
    out: &'a mut String,
    first: bool,
}

impl<'a> CopyLine<'a> {
    pub fn new(out: &'a mut String) -> Self {
        Self { out, first: true }
    }

    fn separator(&mut self) {
        if !self.first {
            self.out.push('\t');
        }
        self.first = false;
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        self.separator();
        self.out.push_str(&value.to_string());
        self
    }

    pub fn text(&mut self, value: Option<&str>) -> &mut Self {
        self.separator();
        match value {
            Some(value) => push_escaped(self.out, value),
            None => self.out.push_str("\\N"),
        }
        self
    }

    pub fn float(&mut self, value: Option<f64>) -> &mut Self {
        self.separator();
        match value {
            Some(v) if v.is_nan() => self.out.push_str("NaN"),
            Some(v) if v == f64::INFINITY => self.out.push_str("Infinity"),
            Some(v) if v == f64::NEG_INFINITY => self.out.push_str("-Infinity"),
            // `Display` for f64 is the shortest text that round-trips exactly.
            Some(v) => self.out.push_str(&v.to_string()),
            None => self.out.push_str("\\N"),
        }
        self
    }

    pub fn timestamp(&mut self, value: DateTime<Utc>) -> &mut Self {
        self.separator();
        self.out
            .push_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true));
        self
    }

    pub fn finish(&mut self) {
        self.out.push('\n');
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0B}' => out.push_str("\\v"),
            '\u{0C}' => out.push_str("\\f"),
            other => out.push(other),
        }
    }
}

pub trait CopyRecord {
    fn write_copy_line(&self, out: &mut String);
}

impl CopyRecord for Company {
    fn write_copy_line(&self, out: &mut String) {
        CopyLine::new(out).int(self.id).text(Some(&self.name)).finish();
    }
}

impl CopyRecord for Problem {
    fn write_copy_line(&self, out: &mut String) {
        CopyLine::new(out)
            .int(self.id)
            .text(self.url.as_deref())
            .text(self.title.as_deref())
            .text(self.difficulty.as_deref())
            .float(self.acceptance)
            .float(self.frequency)
            .timestamp(self.updated_at)
            .finish();
    }
}

impl CopyRecord for ProblemTag {
    fn write_copy_line(&self, out: &mut String) {
        CopyLine::new(out)
            .int(self.problem_id)
            .text(Some(&self.tag))
            .timestamp(self.added_at)
            .finish();
    }
}

impl CopyRecord for CompanyProblem {
    fn write_copy_line(&self, out: &mut String) {
        CopyLine::new(out)
            .int(self.company_id)
            .int(self.problem_id)
            .text(self.source_file.as_deref())
            .text(self.timeframe_tag.as_deref())
            .timestamp(self.last_seen)
            .finish();
    }
}

/// A row type that can be streamed out of one store and copied into another.
pub trait ReplicatedRow: CopyRecord + for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static {
    const SPEC: TableSpec;
}

impl ReplicatedRow for Company {
    const SPEC: TableSpec = COMPANIES;
}

impl ReplicatedRow for Problem {
    const SPEC: TableSpec = PROBLEMS;
}

impl ReplicatedRow for ProblemTag {
    const SPEC: TableSpec = PROBLEM_TAGS;
}

impl ReplicatedRow for CompanyProblem {
    const SPEC: TableSpec = COMPANY_PROBLEMS;
}
