//! Untyped CSV ingest and conversion to typed observations.

use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const REQUIRED_COLUMNS: [&str; 7] = [
    "store",
    "date",
    "holiday_flag",
    "temperature",
    "fuel_price",
    "cpi",
    "unemployment",
];

pub const TARGET_COLUMN: &str = "weekly_sales";

const NULL_TOKENS: [&str; 9] = ["", "na", "n/a", "nan", "null", "none", "#n/a", "-nan", "<na>"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub store: u32,
    pub date: NaiveDate,
    pub holiday_flag: u8,
    pub temperature: f64,
    pub fuel_price: f64,
    pub cpi: f64,
    pub unemployment: f64,
    pub weekly_sales: Option<f64>,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column '{0}'")]
    MissingColumn(String),
    #[error("row {row}: invalid value '{value}' for column '{column}'")]
    InvalidCell {
        row: usize,
        column: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let headers = headers
            .into_iter()
            .map(|header| normalize_header(&header))
            .collect();
        Self { headers, rows }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        debug!(
            component = "table",
            event = "table.read",
            columns = headers.len(),
            rows = rows.len()
        );

        Ok(Self::new(headers, rows))
    }

    pub fn from_path(path: &Path) -> Result<Self, TableError> {
        let file = fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn has_target(&self) -> bool {
        self.has_column(TARGET_COLUMN)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| cell(row, idx)).collect())
    }

    pub fn without_target(&self) -> RawTable {
        let Some(idx) = self.column_index(TARGET_COLUMN) else {
            return self.clone();
        };

        let mut headers = self.headers.clone();
        headers.remove(idx);
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                if idx < row.len() {
                    row.remove(idx);
                }
                row
            })
            .collect();

        RawTable { headers, rows }
    }

    pub fn observations(&self) -> Result<Vec<RawObservation>, TableError> {
        let idx = |name: &'static str| {
            self.column_index(name)
                .ok_or_else(|| TableError::MissingColumn(name.to_string()))
        };
        let store_idx = idx("store")?;
        let date_idx = idx("date")?;
        let holiday_idx = idx("holiday_flag")?;
        let temperature_idx = idx("temperature")?;
        let fuel_idx = idx("fuel_price")?;
        let cpi_idx = idx("cpi")?;
        let unemployment_idx = idx("unemployment")?;
        let target_idx = self.column_index(TARGET_COLUMN);

        let mut out = Vec::with_capacity(self.rows.len());
        for (row_no, row) in self.rows.iter().enumerate() {
            let row_no = row_no + 1;
            let store = parse_cell(row, store_idx, row_no, "store", parse_store)?;
            let date = parse_cell(row, date_idx, row_no, "date", parse_date_dayfirst)?;
            let holiday_flag =
                parse_cell(row, holiday_idx, row_no, "holiday_flag", parse_holiday_flag)?;
            let weekly_sales = match target_idx {
                Some(target_idx) => match cell(row, target_idx) {
                    Some(raw) => Some(parse_number(raw).ok_or_else(|| TableError::InvalidCell {
                        row: row_no,
                        column: TARGET_COLUMN,
                        value: raw.to_string(),
                    })?),
                    None => None,
                },
                None => None,
            };

            out.push(RawObservation {
                store,
                date,
                holiday_flag,
                temperature: parse_cell(row, temperature_idx, row_no, "temperature", parse_number)?,
                fuel_price: parse_cell(row, fuel_idx, row_no, "fuel_price", parse_number)?,
                cpi: parse_cell(row, cpi_idx, row_no, "cpi", parse_number)?,
                unemployment: parse_cell(
                    row,
                    unemployment_idx,
                    row_no,
                    "unemployment",
                    parse_number,
                )?,
                weekly_sales,
            });
        }

        Ok(out)
    }
}

/// Parses a date using the day-first convention: a leading four-digit field is
/// read as `YYYY-MM-DD` (or `YYYY/MM/DD`), anything else as `DD-MM-YYYY`,
/// `DD/MM/YYYY` or `DD.MM.YYYY`. A trailing time component is ignored.
pub fn parse_date_dayfirst(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or(trimmed);
    let leading_digits = date_part.chars().take_while(char::is_ascii_digit).count();

    let formats: &[&str] = if leading_digits == 4 {
        &["%Y-%m-%d", "%Y/%m/%d"]
    } else {
        &["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y"]
    };

    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

pub(crate) fn is_null_token(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    NULL_TOKENS.contains(&lowered.as_str())
}

fn parse_store(raw: &str) -> Option<u32> {
    let value = parse_number(raw)?;
    if value.fract() != 0.0 || value < 1.0 || value > u32::MAX as f64 {
        return None;
    }
    Some(value as u32)
}

fn parse_holiday_flag(raw: &str) -> Option<u8> {
    match parse_number(raw)? {
        v if v == 0.0 => Some(0),
        v if v == 1.0 => Some(1),
        _ => None,
    }
}

fn cell(row: &[String], idx: usize) -> Option<&str> {
    row.get(idx)
        .map(|value| value.trim())
        .filter(|value| !is_null_token(value))
}

fn parse_cell<T>(
    row: &[String],
    idx: usize,
    row_no: usize,
    column: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, TableError> {
    let raw = cell(row, idx).unwrap_or_default();
    parse(raw).ok_or_else(|| TableError::InvalidCell {
        row: row_no,
        column,
        value: raw.to_string(),
    })
}

fn normalize_header(raw: &str) -> String {
    raw.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}
