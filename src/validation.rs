//! Structural, null, type, and range checks on an uploaded table.
//!
//! A missing required column rejects the table immediately. Past that gate
//! every remaining check runs and all violations are reported together.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::table::{parse_date_dayfirst, parse_number, RawTable, REQUIRED_COLUMNS};

pub const STORE_RANGE: (f64, f64) = (1.0, 45.0);
pub const YEAR_RANGE: (i32, i32) = (2000, 2050);
const MAX_REPORTED_EXAMPLES: usize = 5;
const MESSAGE_DELIMITER: &str = " | ";

pub const COVARIATE_RANGES: [(&str, f64, f64); 4] = [
    ("temperature", -50.0, 150.0),
    ("fuel_price", 0.0, 20.0),
    ("cpi", 100.0, 300.0),
    ("unemployment", 0.0, 30.0),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationIssue {
    MissingColumns(Vec<String>),
    NullValues(Vec<(String, usize)>),
    StoreNotNumeric,
    StoreOutOfRange { examples: Vec<String> },
    HolidayFlagNotNumeric,
    HolidayFlagInvalid { examples: Vec<String> },
    DateUnparseable,
    DateOutOfRange,
    NotNumeric { column: String },
    OutOfRange { column: String, min: f64, max: f64 },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingColumns(columns) => {
                write!(f, "missing columns: {}", columns.join(", "))
            }
            Self::NullValues(counts) => {
                let parts: Vec<String> = counts
                    .iter()
                    .map(|(column, count)| format!("{column}={count}"))
                    .collect();
                write!(f, "null values detected: {}", parts.join(", "))
            }
            Self::StoreNotNumeric => write!(f, "'store' must contain only numbers"),
            Self::StoreOutOfRange { examples } => write!(
                f,
                "'store' must be an integer between {} and {}; invalid examples: [{}]",
                STORE_RANGE.0,
                STORE_RANGE.1,
                examples.join(", ")
            ),
            Self::HolidayFlagNotNumeric => write!(f, "'holiday_flag' must contain only 0 or 1"),
            Self::HolidayFlagInvalid { examples } => write!(
                f,
                "'holiday_flag' must be 0 or 1; invalid values: [{}]",
                examples.join(", ")
            ),
            Self::DateUnparseable => {
                write!(f, "invalid date format; use YYYY-MM-DD or DD/MM/YYYY")
            }
            Self::DateOutOfRange => write!(
                f,
                "some dates fall outside the realistic range ({}-{})",
                YEAR_RANGE.0, YEAR_RANGE.1
            ),
            Self::NotNumeric { column } => write!(f, "'{column}' must be numeric"),
            Self::OutOfRange { column, min, max } => {
                write!(f, "'{column}' outside realistic range [{min}, {max}]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub message: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn rejected(issues: Vec<ValidationIssue>) -> Self {
        let message = issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(MESSAGE_DELIMITER);
        Self {
            ok: false,
            message,
            issues,
        }
    }
}

pub fn validate_table(table: &RawTable) -> ValidationReport {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !table.has_column(column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        warn!(
            component = "validation",
            event = "validation.rejected",
            reason = "missing_columns",
            missing = ?missing
        );
        return ValidationReport::rejected(vec![ValidationIssue::MissingColumns(missing)]);
    }

    let mut issues = Vec::new();
    issues.extend(check_nulls(table));
    issues.extend(check_store(table));
    issues.extend(check_holiday_flag(table));
    issues.extend(check_dates(table));
    for (column, min, max) in COVARIATE_RANGES {
        issues.extend(check_numeric_range(table, column, min, max));
    }

    if !issues.is_empty() {
        warn!(
            component = "validation",
            event = "validation.rejected",
            reason = "constraint_violations",
            issue_count = issues.len()
        );
        return ValidationReport::rejected(issues);
    }

    let stores = distinct_stores(table);
    info!(
        component = "validation",
        event = "validation.passed",
        rows = table.len(),
        stores
    );

    ValidationReport {
        ok: true,
        message: format!("validation passed ({} rows, {} stores)", table.len(), stores),
        issues: Vec::new(),
    }
}

fn check_nulls(table: &RawTable) -> Option<ValidationIssue> {
    let counts: Vec<(String, usize)> = REQUIRED_COLUMNS
        .iter()
        .filter_map(|column| {
            let nulls = null_count(table, column)?;
            (nulls > 0).then(|| (column.to_string(), nulls))
        })
        .collect();

    (!counts.is_empty()).then_some(ValidationIssue::NullValues(counts))
}

fn null_count(table: &RawTable, column: &str) -> Option<usize> {
    let cells = table.column(column)?;
    Some(cells.iter().filter(|cell| cell.is_none()).count())
}

fn check_store(table: &RawTable) -> Option<ValidationIssue> {
    let values = match numeric_cells(table, "store") {
        Ok(values) => values,
        Err(()) => return Some(ValidationIssue::StoreNotNumeric),
    };

    let examples = distinct_examples(
        values
            .into_iter()
            .filter(|v| *v < STORE_RANGE.0 || *v > STORE_RANGE.1 || v.fract() != 0.0),
    );
    (!examples.is_empty()).then_some(ValidationIssue::StoreOutOfRange { examples })
}

fn check_holiday_flag(table: &RawTable) -> Option<ValidationIssue> {
    let values = match numeric_cells(table, "holiday_flag") {
        Ok(values) => values,
        Err(()) => return Some(ValidationIssue::HolidayFlagNotNumeric),
    };

    let examples = distinct_examples(values.into_iter().filter(|v| *v != 0.0 && *v != 1.0));
    (!examples.is_empty()).then_some(ValidationIssue::HolidayFlagInvalid { examples })
}

fn check_dates(table: &RawTable) -> Option<ValidationIssue> {
    let cells = table.column("date")?;
    let mut out_of_range = false;
    for raw in cells.into_iter().flatten() {
        let Some(date) = parse_date_dayfirst(raw) else {
            return Some(ValidationIssue::DateUnparseable);
        };
        if date.year() < YEAR_RANGE.0 || date.year() > YEAR_RANGE.1 {
            out_of_range = true;
        }
    }

    out_of_range.then_some(ValidationIssue::DateOutOfRange)
}

fn check_numeric_range(
    table: &RawTable,
    column: &str,
    min: f64,
    max: f64,
) -> Option<ValidationIssue> {
    let values = match numeric_cells(table, column) {
        Ok(values) => values,
        Err(()) => {
            return Some(ValidationIssue::NotNumeric {
                column: column.to_string(),
            })
        }
    };

    values
        .iter()
        .any(|v| *v < min || *v > max)
        .then(|| ValidationIssue::OutOfRange {
            column: column.to_string(),
            min,
            max,
        })
}

fn numeric_cells(table: &RawTable, column: &str) -> Result<Vec<f64>, ()> {
    let Some(cells) = table.column(column) else {
        return Ok(Vec::new());
    };
    cells
        .into_iter()
        .flatten()
        .map(|raw| parse_number(raw).ok_or(()))
        .collect()
}

fn distinct_examples(values: impl Iterator<Item = f64>) -> Vec<String> {
    let mut seen = Vec::new();
    for value in values {
        let text = value.to_string();
        if !seen.contains(&text) {
            seen.push(text);
        }
        if seen.len() >= MAX_REPORTED_EXAMPLES {
            break;
        }
    }
    seen
}

fn distinct_stores(table: &RawTable) -> usize {
    let Some(cells) = table.column("store") else {
        return 0;
    };
    cells
        .into_iter()
        .flatten()
        .filter_map(parse_number)
        .map(|v| v as i64)
        .collect::<BTreeSet<_>>()
        .len()
}
