//! Delimited-text export of forecasts.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::predictor::PredictionRow;

pub const EXPORT_COLUMNS: [&str; 3] = ["store", "date", "predicted_sales"];

#[derive(Serialize)]
struct ExportRecord {
    store: u32,
    date: String,
    predicted_sales: f64,
}

pub fn write_predictions_csv<W: Write>(writer: W, rows: &[PredictionRow]) -> Result<(), csv::Error> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(EXPORT_COLUMNS)?;
    for row in rows {
        csv_writer.serialize(ExportRecord {
            store: row.store,
            date: row.date.format("%Y-%m-%d").to_string(),
            predicted_sales: row.predicted_sales,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_predictions_csv_file(path: &Path, rows: &[PredictionRow]) -> Result<(), csv::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_predictions_csv(fs::File::create(path)?, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn exports_three_columns_with_iso_dates() {
        let rows = vec![
            PredictionRow {
                store: 3,
                date: NaiveDate::from_ymd_opt(2012, 11, 2).unwrap(),
                predicted_sales: 402_918.25,
                cluster: 2,
            },
            PredictionRow {
                store: 14,
                date: NaiveDate::from_ymd_opt(2012, 11, 9).unwrap(),
                predicted_sales: 1_999_001.5,
                cluster: 0,
            },
        ];

        let mut buf = Vec::new();
        write_predictions_csv(&mut buf, &rows).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "store,date,predicted_sales\n3,2012-11-02,402918.25\n14,2012-11-09,1999001.5\n"
        );
    }

    #[test]
    fn empty_export_is_header_only() {
        let mut buf = Vec::new();
        write_predictions_csv(&mut buf, &[]).unwrap();
        assert_eq!(buf, b"store,date,predicted_sales\n");
    }
}
