//! CSV Sample Loader
//!
//! Derives a schema descriptor and sample rows from a local CSV file.

use crate::error::Result;
use crate::model::{ColumnType, Row, SchemaDescriptor};
use csv::ReaderBuilder;
use serde_json::Value;
use std::io::Read;

/// Schema and leading rows of a CSV source.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvSample {
    pub schema: SchemaDescriptor,
    pub sample_rows: Vec<Row>,
}

pub fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }

    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }

    Value::String(trimmed.to_string())
}

/// Read the header and up to `sample_size` records. Each column's type comes from its
/// first non-null sampled value; columns with none are text.
pub fn read_sample<R: Read>(reader: R, sample_size: usize) -> Result<CsvSample> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    let mut sample_rows = Vec::new();
    for result in rdr.records().take(sample_size) {
        let record = result?;
        let mut row = Row::new();
        for (idx, header) in headers.iter().enumerate() {
            row.insert(header.clone(), coerce_cell(record.get(idx).unwrap_or("")));
        }
        sample_rows.push(row);
    }

    let schema = headers
        .iter()
        .map(|header| {
            let ty = sample_rows
                .iter()
                .filter_map(|row| row.get(header))
                .find(|value| !value.is_null())
                .map(ColumnType::infer)
                .unwrap_or(ColumnType::Text);
            (header.clone(), ty)
        })
        .collect();

    Ok(CsvSample { schema, sample_rows })
}

pub fn read_sample_file(path: &std::path::Path, sample_size: usize) -> Result<CsvSample> {
    let file = std::fs::File::open(path)?;
    read_sample(file, sample_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEOPLE: &str = "Name,Age,Score,Active,Joined,IP\n\
Ana,34,4.5,true,2024-01-10,10.0.0.7\n\
Rui,,3.25,false,2023-11-02,10.0.0.9\n\
Eva,27,,true,2022-05-30T08:00:00,\n";

    #[test]
    fn test_schema_inferred_from_first_non_null_value() {
        let sample = read_sample(PEOPLE.as_bytes(), 10).unwrap();
        assert_eq!(sample.schema["Name"], ColumnType::Text);
        assert_eq!(sample.schema["Age"], ColumnType::Integer);
        assert_eq!(sample.schema["Score"], ColumnType::Numeric);
        assert_eq!(sample.schema["Active"], ColumnType::Boolean);
        assert_eq!(sample.schema["Joined"], ColumnType::Timestamp);
        assert_eq!(sample.schema["IP"], ColumnType::Text);
        assert_eq!(sample.sample_rows.len(), 3);
        assert!(sample.sample_rows[1]["Age"].is_null());
    }

    #[test]
    fn test_sample_size_limits_rows() {
        let sample = read_sample(PEOPLE.as_bytes(), 1).unwrap();
        assert_eq!(sample.sample_rows.len(), 1);
        assert_eq!(sample.sample_rows[0]["Name"], "Ana");
    }

    #[test]
    fn test_columns_without_values_default_to_text() {
        let sample = read_sample("A,B\n,\n".as_bytes(), 5).unwrap();
        assert_eq!(sample.schema["A"], ColumnType::Text);
        assert_eq!(sample.schema["B"], ColumnType::Text);
    }
}
