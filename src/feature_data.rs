use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::{izip, Itertools};
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    csv_parser::{self, utils::*, FEATURE_KEY, FEATURE_SCHEMA},
    datastructures::*,
    error::StoreError,
    lock::{Persisted, DEFAULT_LOCK_TIMEOUT},
};

const FEATURE_AXIS: Axis = Axis(0);
const INSTANCE_AXIS: Axis = Axis(1);

/// Features an extractor computes, as (feature group, feature name) pairs.
pub type ExtractorFeatures = BTreeMap<Extractor, Vec<(String, String)>>;

#[derive(Serialize, Deserialize)]
struct Dimensions {
    features: Vec<FeatureKey>,
    instances: Vec<Instance>,
}

/// Feature values addressed by (extractor, feature group, feature name) rows
/// and instance columns.
///
/// Rows are the features declared by each registered extractor; the extractor
/// is part of the row key. Rows and instances are kept sorted.
#[derive(Debug, Clone)]
pub struct FeatureDataStore {
    path: PathBuf,
    features: Vec<FeatureKey>,
    instances: Vec<Instance>,
    values: Array2<f64>,
}

// Missing values compare equal to each other.
impl PartialEq for FeatureDataStore {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.features == other.features
            && self.instances == other.instances
            && self.values.shape() == other.values.shape()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| (is_missing(*a) && is_missing(*b)) || a == b)
    }
}

impl FeatureDataStore {
    /// Create an all-missing store with a row for every declared feature of
    /// every extractor in `extractors`, and persist it.
    pub fn create(
        path: &Path,
        extractors: &[&str],
        instances: &[&str],
        extractor_features: &ExtractorFeatures,
    ) -> Result<FeatureDataStore> {
        if path.exists() {
            FeatureDataStore::load(path).with_context(|| {
                format!("refusing to replace unreadable data at {path:?}")
            })?;
            warn!("Overwriting existing feature data {path:?}");
        }
        let store =
            FeatureDataStore::new(path, extractors, instances, extractor_features)?;
        store.save(DEFAULT_LOCK_TIMEOUT)?;
        info!(
            "Created feature data {path:?}: {} features, {} instances",
            store.features.len(),
            store.instances.len()
        );
        Ok(store)
    }

    pub fn new(
        path: &Path,
        extractors: &[&str],
        instances: &[&str],
        extractor_features: &ExtractorFeatures,
    ) -> Result<FeatureDataStore> {
        let instances = instances
            .iter()
            .map(|i| i.to_string())
            .sorted()
            .dedup()
            .collect_vec();
        let mut store = FeatureDataStore {
            path: path.to_path_buf(),
            features: vec![],
            values: Array2::from_elem((0, instances.len()), MISSING),
            instances,
        };
        for extractor in extractors {
            let features = extractor_features
                .get(*extractor)
                .ok_or_else(|| StoreError::UnknownExtractor(extractor.to_string()))?;
            store.add_extractor(extractor, features)?;
        }
        Ok(store)
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn features(&self) -> &[FeatureKey] {
        &self.features
    }

    pub fn extractors(&self) -> Vec<&str> {
        self.features
            .iter()
            .map(|f| f.extractor.as_str())
            .dedup()
            .collect()
    }

    /// Number of features `extractor` contributes per instance.
    pub fn output_dimension(&self, extractor: &str) -> usize {
        self.extractor_rows(extractor).len()
    }

    /// Sorted feature groups of `extractor`, or of all extractors.
    pub fn get_feature_groups(&self, extractor: Option<&str>) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| extractor.map_or(true, |e| f.extractor == e))
            .map(|f| f.group.clone())
            .sorted()
            .dedup()
            .collect()
    }

    fn extractor_rows(&self, extractor: &str) -> std::ops::Range<usize> {
        let start = self
            .features
            .partition_point(|f| f.extractor.as_str() < extractor);
        let end = self
            .features
            .partition_point(|f| f.extractor.as_str() <= extractor);
        start..end
    }

    fn feature_index(
        &self,
        extractor: &str,
        group: &str,
        name: &str,
    ) -> Result<usize> {
        self.features
            .binary_search(&FeatureKey::new(extractor, group, name))
            .map_err(|_| {
                if self.extractor_rows(extractor).is_empty() {
                    StoreError::UnknownExtractor(extractor.into()).into()
                } else {
                    StoreError::UnknownFeature {
                        extractor: extractor.into(),
                        group: group.into(),
                        name: name.into(),
                    }
                    .into()
                }
            })
    }

    fn instance_index(&self, instance: &str) -> Result<usize> {
        self.instances
            .binary_search_by(|i| i.as_str().cmp(instance))
            .map_err(|_| StoreError::UnknownInstance(instance.into()).into())
    }

    /// Register `extractor` with its declared features; all values start
    /// missing.
    pub fn add_extractor(
        &mut self,
        extractor: &str,
        features: &[(String, String)],
    ) -> Result<()> {
        if !self.extractor_rows(extractor).is_empty() {
            warn!("Extractor {extractor} already present in {:?}", self.path);
            return Ok(());
        }
        if features.is_empty() {
            return Err(StoreError::Invalid(format!(
                "extractor {extractor} declares no features"
            ))
            .into());
        }
        for (group, name) in features.iter().sorted().dedup() {
            let key = FeatureKey::new(extractor, group, name);
            let index = self.features.partition_point(|f| f < &key);
            self.values = insert_index(&self.values, FEATURE_AXIS, index, MISSING)?;
            self.features.insert(index, key);
        }
        debug!(
            "Added extractor {extractor} with {} features",
            self.output_dimension(extractor)
        );
        Ok(())
    }

    pub fn remove_extractor(&mut self, extractor: &str) -> Result<()> {
        let rows = self.extractor_rows(extractor);
        if rows.is_empty() {
            warn!("Extractor {extractor} not present in {:?}", self.path);
            return Ok(());
        }
        for index in rows.rev() {
            self.values = remove_index(&self.values, FEATURE_AXIS, index)?;
            self.features.remove(index);
        }
        Ok(())
    }

    /// Add an instance column, filled with `values` in feature order or with
    /// the missing sentinel.
    pub fn add_instance(
        &mut self,
        instance: &str,
        values: Option<Vec<f64>>,
    ) -> Result<()> {
        let Err(index) =
            self.instances.binary_search_by(|i| i.as_str().cmp(instance))
        else {
            warn!("Instance {instance} already present in {:?}", self.path);
            return Ok(());
        };
        let values = values.unwrap_or_else(|| vec![MISSING; self.features.len()]);
        if values.len() != self.features.len() {
            return Err(StoreError::DimensionMismatch {
                what: "instance feature vector",
                expected: self.features.len(),
                actual: values.len(),
            }
            .into());
        }
        self.values = insert_index(&self.values, INSTANCE_AXIS, index, MISSING)?;
        self.values
            .column_mut(index)
            .iter_mut()
            .zip(values)
            .for_each(|(cell, value)| *cell = value);
        self.instances.insert(index, instance.to_string());
        Ok(())
    }

    pub fn remove_instance(&mut self, instance: &str) -> Result<()> {
        match self.instance_index(instance) {
            Ok(index) => {
                self.values = remove_index(&self.values, INSTANCE_AXIS, index)?;
                self.instances.remove(index);
            }
            Err(_) => {
                warn!("Instance {instance} not present in {:?}", self.path)
            }
        }
        Ok(())
    }

    pub fn get_value(
        &self,
        instance: &str,
        extractor: &str,
        group: &str,
        name: &str,
    ) -> Result<f64> {
        let row = self.feature_index(extractor, group, name)?;
        Ok(self.values[[row, self.instance_index(instance)?]])
    }

    pub fn set_value(
        &mut self,
        instance: &str,
        extractor: &str,
        group: &str,
        name: &str,
        value: f64,
    ) -> Result<()> {
        let row = self.feature_index(extractor, group, name)?;
        let column = self.instance_index(instance)?;
        self.values[[row, column]] = value;
        Ok(())
    }

    /// Write one extractor result: (feature group, feature name, value)
    /// triples for a single instance. Nothing is written if any triple names
    /// an unknown feature.
    pub fn set_values(
        &mut self,
        instance: &str,
        extractor: &str,
        values: &[(String, String, f64)],
    ) -> Result<()> {
        let column = self.instance_index(instance)?;
        let rows = values
            .iter()
            .map(|(group, name, _)| self.feature_index(extractor, group, name))
            .collect::<Result<Vec<_>>>()?;
        for (row, (_, _, value)) in rows.into_iter().zip(values) {
            self.values[[row, column]] = *value;
        }
        Ok(())
    }

    /// Feature vector of `instance` in feature order.
    pub fn get_instance(&self, instance: &str) -> Result<Vec<f64>> {
        Ok(self
            .values
            .column(self.instance_index(instance)?)
            .to_vec())
    }

    /// Extractors with at least one missing value, per instance. Instances
    /// without outstanding work are left out.
    pub fn remaining_jobs(&self) -> BTreeMap<Instance, BTreeSet<Extractor>> {
        let mut remaining: BTreeMap<Instance, BTreeSet<Extractor>> =
            BTreeMap::new();
        for ((row, column), value) in self.values.indexed_iter() {
            if is_missing(*value) {
                remaining
                    .entry(self.instances[column].clone())
                    .or_default()
                    .insert(self.features[row].extractor.clone());
            }
        }
        remaining
    }

    /// Groupwise jobs: a feature group of an extractor is outstanding on an
    /// instance when none of its features has a value yet.
    pub fn remaining_group_jobs(&self) -> Vec<FeatureJob> {
        let grouped = self
            .features
            .iter()
            .enumerate()
            .group_by(|(_, f)| (f.extractor.clone(), f.group.clone()));
        let groups = (&grouped)
            .into_iter()
            .map(|(key, rows)| (key, rows.map(|(row, _)| row).collect_vec()))
            .collect_vec();
        self.instances
            .iter()
            .enumerate()
            .flat_map(|(column, instance)| {
                groups
                    .iter()
                    .filter(move |(_, rows)| {
                        rows.iter().all(|row| is_missing(self.values[[*row, column]]))
                    })
                    .map(move |((extractor, group), _)| FeatureJob {
                        instance: instance.clone(),
                        extractor: extractor.clone(),
                        feature_group: Some(group.clone()),
                    })
            })
            .collect()
    }

    pub fn has_missing_value(&self) -> bool {
        self.values.iter().any(|v| is_missing(*v))
    }

    /// Whether some extractor has not produced any value for some instance.
    pub fn has_missing_vectors(&self) -> bool {
        self.extractors().iter().any(|extractor| {
            let rows = self.extractor_rows(extractor);
            self.values
                .slice(ndarray::s![rows, ..])
                .axis_iter(INSTANCE_AXIS)
                .any(|column| column.iter().all(|v| is_missing(*v)))
        })
    }

    /// Replace missing values by the mean of their feature over all instances.
    /// Features without any value stay missing. Returns whether the store is
    /// complete afterwards.
    pub fn impute_missing_values(&mut self) -> bool {
        let mut imputed = 0;
        for mut row in self.values.axis_iter_mut(FEATURE_AXIS) {
            let present = row.iter().filter(|v| !is_missing(**v)).collect_vec();
            if present.is_empty() || present.len() == row.len() {
                continue;
            }
            let mean = present.iter().copied().sum::<f64>() / present.len() as f64;
            for value in row.iter_mut().filter(|v| is_missing(**v)) {
                *value = mean;
                imputed += 1;
            }
        }
        if imputed > 0 {
            warn!("Imputed {imputed} missing feature values in {:?}", self.path);
        }
        !self.has_missing_value()
    }

    /// Set every value to missing.
    pub fn reset(&mut self) {
        self.values.fill(MISSING);
    }

    /// Instance column plus one column per feature named
    /// `extractor:group:feature`.
    pub fn to_external_frame(&self) -> Result<DataFrame> {
        let mut columns = vec![Series::new("instance", &self.instances)];
        for (feature, row) in self.features.iter().zip(self.values.rows()) {
            columns.push(f64_series(&feature.to_string(), row.iter().copied()));
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Write [`Self::to_external_frame`] to `target`.
    pub fn to_external_format(&self, target: &Path) -> Result<()> {
        let mut df = self.to_external_frame()?;
        csv_parser::write_csv(target, &mut df)
    }

    /// Long-format frame of every present value.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let rows = self
            .values
            .indexed_iter()
            .filter(|(_, v)| !is_missing(**v))
            .map(|((row, column), v)| (&self.features[row], &self.instances[column], *v))
            .collect_vec();
        Ok(DataFrame::new(vec![
            Series::new(
                "instance",
                rows.iter().map(|(_, i, _)| i.as_str()).collect_vec(),
            ),
            Series::new(
                "extractor",
                rows.iter().map(|(f, _, _)| f.extractor.as_str()).collect_vec(),
            ),
            Series::new(
                "feature_group",
                rows.iter().map(|(f, _, _)| f.group.as_str()).collect_vec(),
            ),
            Series::new(
                "feature_name",
                rows.iter().map(|(f, _, _)| f.name.as_str()).collect_vec(),
            ),
            Series::new("value", rows.iter().map(|(_, _, v)| *v).collect_vec()),
        ])?)
    }
}

impl Persisted for FeatureDataStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<FeatureDataStore> {
        let (dimensions, df): (Dimensions, DataFrame) =
            csv_parser::read_store(path, &FEATURE_SCHEMA, &FEATURE_KEY)?;
        let structural = |reason: String| StoreError::Structural {
            path: path.to_path_buf(),
            reason,
        };
        let features = dimensions
            .features
            .into_iter()
            .sorted()
            .dedup()
            .collect_vec();
        let instances = dimensions
            .instances
            .into_iter()
            .sorted()
            .dedup()
            .collect_vec();
        let mut store = FeatureDataStore {
            path: path.to_path_buf(),
            values: Array2::from_elem((features.len(), instances.len()), MISSING),
            features,
            instances,
        };
        for (instance, extractor, group, name, value) in izip!(
            key_column(&df, "instance")?,
            key_column(&df, "extractor")?,
            key_column(&df, "feature_group")?,
            key_column(&df, "feature_name")?,
            f64_column(&df, "value")?
        ) {
            store
                .set_value(&instance, &extractor, &group, &name, value)
                .map_err(|e| structural(e.to_string()))?;
        }
        Ok(store)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut df = self.to_dataframe()?;
        csv_parser::encode_store(
            &Dimensions {
                features: self.features.clone(),
                instances: self.instances.clone(),
            },
            &mut df,
        )
        .with_context(|| format!("encoding feature data {:?}", self.path))
    }
}
