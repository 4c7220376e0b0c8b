use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Outcome;
use crate::model::UserId;
use crate::policy::Policy;

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: empty coupon code")]
    EmptyCode { line: usize },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv writer: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    code: String,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    policy: &'a str,
    contender: usize,
    user: UserId,
    read_id: Option<u64>,
    read_version: Option<u64>,
    written_id: Option<u64>,
    written_owner: Option<UserId>,
    written_version: Option<u64>,
    error: String,
}

/// One contender's result in a race, as printed by the binary.
#[derive(Debug, Clone)]
pub struct RaceRecord {
    pub policy: Policy,
    pub contender: usize,
    pub user: UserId,
    pub outcome: Outcome,
}

/// Read coupon codes from a csv file with a `code` column
pub fn read_coupons(path: impl AsRef<Path>) -> Result<Vec<String>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            if row.code.is_empty() {
                return Err(CsvError::EmptyCode { line });
            }
            Ok(row.code)
        })
        .collect()
}

/// Write race outcomes in csv format
pub fn write_outcomes<'a, W: io::Write>(
    writer: W,
    records: impl IntoIterator<Item = &'a RaceRecord>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for record in records {
        let outcome = &record.outcome;
        let row = OutputRow {
            policy: record.policy.name(),
            contender: record.contender,
            user: record.user,
            read_id: outcome.read.as_ref().map(|c| c.id),
            read_version: outcome.read.as_ref().map(|c| c.version),
            written_id: outcome.written.as_ref().map(|c| c.id),
            written_owner: outcome.written.as_ref().and_then(|c| c.owner),
            written_version: outcome.written.as_ref().map(|c| c.version),
            error: outcome.error.map(|e| e.to_string()).unwrap_or_default(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
