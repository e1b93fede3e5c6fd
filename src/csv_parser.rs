use std::{fs, io::Cursor, path::Path};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::debug;
use polars::prelude::*;
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::StoreError, lock::atomic_write};

pub mod utils;

/// Marker of the line that carries the dimension lists of a store file.
pub const DIMENSIONS_MARKER: &str = "#dimensions ";

/// Long-format columns of a persisted performance store.
pub const PERFORMANCE_SCHEMA: [(&str, DataType); 7] = [
    ("objective", DataType::Utf8),
    ("instance", DataType::Utf8),
    ("run", DataType::Int64),
    ("solver", DataType::Utf8),
    ("value", DataType::Float64),
    ("seed", DataType::Int64),
    ("configuration", DataType::Utf8),
];

/// Key columns of [`PERFORMANCE_SCHEMA`].
pub const PERFORMANCE_KEY: [&str; 4] = ["objective", "instance", "run", "solver"];

/// Long-format columns of a persisted feature store.
pub const FEATURE_SCHEMA: [(&str, DataType); 5] = [
    ("instance", DataType::Utf8),
    ("extractor", DataType::Utf8),
    ("feature_group", DataType::Utf8),
    ("feature_name", DataType::Utf8),
    ("value", DataType::Float64),
];

/// Key columns of [`FEATURE_SCHEMA`].
pub const FEATURE_KEY: [&str; 4] =
    ["instance", "extractor", "feature_group", "feature_name"];

/// Columns of a persisted registry table.
pub const TABLE_SCHEMA: [(&str, DataType); 3] = [
    ("row", DataType::Utf8),
    ("column", DataType::Utf8),
    ("value", DataType::Utf8),
];

/// Key columns of [`TABLE_SCHEMA`].
pub const TABLE_KEY: [&str; 2] = ["row", "column"];

/// Read a store file: the dimension header line followed by a normalized csv
/// with exactly the columns of `schema`.
///
/// Rows repeating a key are collapsed, the last occurrence wins. Anything that
/// does not decode is a [`StoreError::Structural`].
pub fn read_store<H: DeserializeOwned>(
    path: &Path,
    schema: &[(&str, DataType)],
    key: &[&str],
) -> Result<(H, DataFrame)> {
    let structural = |reason: String| StoreError::Structural {
        path: path.to_path_buf(),
        reason,
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading data store {path:?}"))?;
    let (first_line, body) = content.split_once('\n').unwrap_or((&content, ""));
    let dimensions = first_line
        .trim_end_matches('\r')
        .strip_prefix(DIMENSIONS_MARKER)
        .ok_or_else(|| structural("missing dimension header".to_string()))?;
    let header: H = serde_json::from_str(dimensions)
        .map_err(|e| structural(format!("invalid dimension header: {e}")))?;

    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let column_line = lines
        .next()
        .ok_or_else(|| structural("missing column header".to_string()))?;
    let columns = column_line.split(',').map(str::trim).collect_vec();
    let expected = schema.iter().map(|(name, _)| *name).collect_vec();
    if columns != expected {
        return Err(structural(format!(
            "expected columns {expected:?}, found {columns:?}"
        ))
        .into());
    }
    if lines.next().is_none() {
        return Ok((header, empty_frame(schema)?));
    }
    check_records(body, schema.len()).map_err(structural)?;

    let df = CsvReader::new(Cursor::new(body.as_bytes().to_vec()))
        .has_header(true)
        .with_dtypes(Some(&Schema::from(
            schema
                .iter()
                .map(|(name, dtype)| Field::new(name, dtype.clone())),
        )))
        .finish()
        .map_err(|e| structural(e.to_string()))?;
    for name in key {
        let column = df.column(name).map_err(|e| structural(e.to_string()))?;
        let empty = match column.utf8() {
            Ok(values) => values.into_iter().any(|v| v.map_or(true, str::is_empty)),
            Err(_) => column.null_count() > 0,
        };
        if empty {
            return Err(structural(format!("key column {name} has an empty cell")).into());
        }
    }
    let rows = df.height();
    let df = df
        .lazy()
        .unique_stable(
            Some(key.iter().map(|s| s.to_string()).collect_vec()),
            UniqueKeepStrategy::Last,
        )
        .collect()?;
    if df.height() < rows {
        debug!(
            "Collapsed {} duplicate rows in {path:?}",
            rows - df.height()
        );
    }
    Ok((header, df))
}

/// Every record of a csv body must have `width` fields and end in a newline.
/// A partially written file fails here instead of loading with null cells.
fn check_records(body: &str, width: usize) -> Result<(), String> {
    let mut quoted = false;
    let mut fields = 1;
    let mut record = 0;
    let mut blank = true;
    for c in body.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields += 1,
            '\n' if !quoted => {
                if !blank {
                    if fields != width {
                        return Err(format!(
                            "record {record} has {fields} fields, expected {width}"
                        ));
                    }
                    record += 1;
                }
                fields = 1;
                blank = true;
                continue;
            }
            '\r' if !quoted => continue,
            _ => {}
        }
        blank = false;
    }
    if quoted || !blank {
        return Err(format!("record {record} is not terminated"));
    }
    Ok(())
}

/// Encode a store: dimension header line, then `df` as csv.
pub fn encode_store<H: Serialize>(
    header: &H,
    df: &mut DataFrame,
) -> Result<Vec<u8>> {
    let mut buf = format!(
        "{DIMENSIONS_MARKER}{}\n",
        serde_json::to_string(header)?
    )
    .into_bytes();
    if df.height() == 0 {
        buf.extend(df.get_column_names().join(",").into_bytes());
        buf.push(b'\n');
    } else {
        CsvWriter::new(&mut buf).has_header(true).finish(df)?;
    }
    Ok(buf)
}

/// Write a plain csv export (no dimension header) atomically.
pub fn write_csv(path: &Path, df: &mut DataFrame) -> Result<()> {
    let mut buf = Vec::new();
    CsvWriter::new(&mut buf).has_header(true).finish(df)?;
    atomic_write(path, &buf)
        .with_context(|| format!("writing export {path:?}"))
}

/// Zero-row frame with the columns of `schema`.
pub fn empty_frame(schema: &[(&str, DataType)]) -> Result<DataFrame> {
    Ok(DataFrame::new(
        schema
            .iter()
            .map(|(name, dtype)| Series::new_empty(name, dtype))
            .collect_vec(),
    )?)
}
