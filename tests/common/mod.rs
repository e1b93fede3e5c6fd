#![allow(dead_code)]
use std::path::{Path, PathBuf};

use portfolio_data::{
    feature_data::{ExtractorFeatures, FeatureDataStore},
    objective::Objective,
    performance_data::PerformanceDataStore,
};

pub fn objectives(specification: &str) -> Vec<Objective> {
    Objective::parse_list(specification).unwrap()
}

pub fn performance_path(dir: &Path) -> PathBuf {
    dir.join("performance_data.csv")
}

pub fn feature_path(dir: &Path) -> PathBuf {
    dir.join("feature_data.csv")
}

/// Persisted PAR10 store with the given solvers and instances.
pub fn performance_store(
    dir: &Path,
    solvers: &[&str],
    instances: &[&str],
    n_runs: u32,
) -> PerformanceDataStore {
    PerformanceDataStore::create(
        &performance_path(dir),
        solvers,
        &objectives("PAR10"),
        instances,
        n_runs,
    )
    .unwrap()
}

/// (group, name) pairs for an extractor.
pub fn features(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(group, name)| (group.to_string(), name.to_string()))
        .collect()
}

pub fn feature_store(
    dir: &Path,
    extractor_features: &[(&str, &[(&str, &str)])],
    instances: &[&str],
) -> FeatureDataStore {
    let declared: ExtractorFeatures = extractor_features
        .iter()
        .map(|(extractor, pairs)| (extractor.to_string(), features(pairs)))
        .collect();
    let extractors = extractor_features.iter().map(|(e, _)| *e).collect::<Vec<_>>();
    FeatureDataStore::create(&feature_path(dir), &extractors, instances, &declared).unwrap()
}
