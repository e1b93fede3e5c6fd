use anyhow::Result;
use polars::prelude::*;

use crate::datastructures::MISSING;

/// Values of a float column; nulls become the missing sentinel.
pub fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(MISSING))
        .collect())
}

pub fn i64_column(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>> {
    let series = df.column(name)?.cast(&DataType::Int64)?;
    Ok(series.i64()?.into_iter().collect())
}

/// Values of a string column; empty strings are treated as null.
pub fn utf8_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::Utf8)?;
    Ok(series
        .utf8()?
        .into_iter()
        .map(|v| v.filter(|s| !s.is_empty()).map(str::to_string))
        .collect())
}

/// Values of a string column that must not contain nulls.
pub fn key_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    utf8_column(df, name)?
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.ok_or_else(|| {
                anyhow::anyhow!("column {name} is empty in row {row}")
            })
        })
        .collect()
}

/// Series of optional floats, writing the missing sentinel as null.
pub fn f64_series(name: &str, values: impl IntoIterator<Item = f64>) -> Series {
    Series::new(
        name,
        values
            .into_iter()
            .map(|v| (!v.is_nan()).then_some(v))
            .collect::<Vec<Option<f64>>>(),
    )
}
