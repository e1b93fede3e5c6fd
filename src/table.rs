use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::{izip, Itertools};
use log::warn;
use ndarray::{Array2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    csv_parser::{self, utils::*, TABLE_KEY, TABLE_SCHEMA},
    datastructures::{insert_index, remove_index},
    error::StoreError,
    lock::{Persisted, DEFAULT_LOCK_TIMEOUT},
};

#[derive(Serialize, Deserialize)]
struct Dimensions {
    rows: Vec<String>,
    columns: Vec<String>,
}

/// Named rows by named columns of optional strings, persisted under the store
/// lock. Rows are kept sorted; columns keep their declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    path: PathBuf,
    rows: Vec<String>,
    columns: Vec<String>,
    values: Array2<Option<String>>,
}

impl Table {
    pub fn create(path: &Path, columns: &[&str]) -> Result<Table> {
        if path.exists() {
            Table::load(path)?;
            warn!("Overwriting existing table {path:?}");
        }
        let table = Table {
            path: path.to_path_buf(),
            rows: vec![],
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values: Array2::default((0, columns.len())),
        };
        table.save(DEFAULT_LOCK_TIMEOUT)?;
        Ok(table)
    }

    /// Load `path` if it exists, create an empty table otherwise.
    pub fn open(path: &Path, columns: &[&str]) -> Result<Table> {
        if path.exists() {
            Table::load(path)
        } else {
            Table::create(path, columns)
        }
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn contains(&self, row: &str) -> bool {
        self.rows.binary_search_by(|r| r.as_str().cmp(row)).is_ok()
    }

    pub fn add_row(
        &mut self,
        row: &str,
        values: Option<Vec<Option<String>>>,
    ) -> Result<()> {
        let index = match self.rows.binary_search_by(|r| r.as_str().cmp(row)) {
            Ok(_) => {
                warn!("Row {row} already present in {:?}", self.path);
                return Ok(());
            }
            Err(index) => index,
        };
        let values = values.unwrap_or_else(|| vec![None; self.columns.len()]);
        if values.len() != self.columns.len() {
            return Err(StoreError::DimensionMismatch {
                what: "table row",
                expected: self.columns.len(),
                actual: values.len(),
            }
            .into());
        }
        self.values = insert_index(&self.values, Axis(0), index, None)?;
        for (cell, value) in self.values.row_mut(index).iter_mut().zip(values) {
            *cell = value;
        }
        self.rows.insert(index, row.to_string());
        Ok(())
    }

    pub fn remove_row(&mut self, row: &str) -> Result<()> {
        match self.rows.binary_search_by(|r| r.as_str().cmp(row)) {
            Ok(index) => {
                self.values = remove_index(&self.values, Axis(0), index)?;
                self.rows.remove(index);
            }
            Err(_) => warn!("Row {row} not present in {:?}", self.path),
        }
        Ok(())
    }

    pub fn add_column(&mut self, column: &str) -> Result<()> {
        if self.columns.iter().any(|c| c == column) {
            warn!("Column {column} already present in {:?}", self.path);
            return Ok(());
        }
        self.values =
            insert_index(&self.values, Axis(1), self.columns.len(), None)?;
        self.columns.push(column.to_string());
        Ok(())
    }

    pub fn remove_column(&mut self, column: &str) -> Result<()> {
        match self.columns.iter().position(|c| c == column) {
            Some(index) => {
                self.values = remove_index(&self.values, Axis(1), index)?;
                self.columns.remove(index);
            }
            None => warn!("Column {column} not present in {:?}", self.path),
        }
        Ok(())
    }

    pub fn get(&self, row: &str, column: &str) -> Result<Option<&str>> {
        let (r, c) = self.position(row, column)?;
        Ok(self.values[[r, c]].as_deref())
    }

    pub fn set(
        &mut self,
        row: &str,
        column: &str,
        value: Option<String>,
    ) -> Result<()> {
        let (r, c) = self.position(row, column)?;
        self.values[[r, c]] = value;
        Ok(())
    }

    /// Rows whose `column` equals `value`.
    pub fn find(&self, column: &str, value: &str) -> Vec<&str> {
        let Some(c) = self.columns.iter().position(|col| col == column) else {
            return vec![];
        };
        self.rows
            .iter()
            .zip(self.values.column(c))
            .filter(|(_, v)| v.as_deref() == Some(value))
            .map(|(r, _)| r.as_str())
            .collect()
    }

    fn position(&self, row: &str, column: &str) -> Result<(usize, usize)> {
        let r = self
            .rows
            .binary_search_by(|x| x.as_str().cmp(row))
            .map_err(|_| StoreError::Invalid(format!("unknown row {row}")))?;
        let c = self.columns.iter().position(|x| x == column).ok_or_else(
            || StoreError::Invalid(format!("unknown column {column}")),
        )?;
        Ok((r, c))
    }
}

impl Persisted for Table {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Table> {
        let (dimensions, df): (Dimensions, DataFrame) =
            csv_parser::read_store(path, &TABLE_SCHEMA, &TABLE_KEY)?;
        let mut rows = dimensions.rows;
        rows.sort();
        rows.dedup();
        let mut table = Table {
            path: path.to_path_buf(),
            values: Array2::default((rows.len(), dimensions.columns.len())),
            rows,
            columns: dimensions.columns,
        };
        let structural = |reason: String| StoreError::Structural {
            path: path.to_path_buf(),
            reason,
        };
        for (row, column, value) in izip!(
            key_column(&df, "row")?,
            key_column(&df, "column")?,
            utf8_column(&df, "value")?
        ) {
            let (r, c) = table
                .position(&row, &column)
                .map_err(|e| structural(e.to_string()))?;
            table.values[[r, c]] = value;
        }
        Ok(table)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let cells = self
            .rows
            .iter()
            .cartesian_product(self.columns.iter())
            .zip(self.values.iter())
            .filter_map(|((r, c), v)| v.as_ref().map(|v| (r, c, v)))
            .collect_vec();
        let mut df = DataFrame::new(vec![
            Series::new("row", cells.iter().map(|(r, _, _)| r.as_str()).collect_vec()),
            Series::new("column", cells.iter().map(|(_, c, _)| c.as_str()).collect_vec()),
            Series::new("value", cells.iter().map(|(_, _, v)| v.as_str()).collect_vec()),
        ])?;
        csv_parser::encode_store(
            &Dimensions {
                rows: self.rows.clone(),
                columns: self.columns.clone(),
            },
            &mut df,
        )
        .with_context(|| format!("encoding table {:?}", self.path))
    }
}
