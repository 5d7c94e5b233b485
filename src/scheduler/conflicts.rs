//! Write-conflict detection within a layer.

use std::collections::BTreeMap;

use serde::Serialize;

use super::layers::{normalize_path, Layer};
use crate::core::StepId;

/// A file written by more than one step of the same layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileConflict {
    pub path: String,
    pub steps: Vec<StepId>,
}

/// Files targeted by two or more steps, sorted by path.
pub fn detect_conflicts(layer: &Layer) -> Vec<FileConflict> {
    let mut writers: BTreeMap<String, Vec<StepId>> = BTreeMap::new();
    for step in &layer.steps {
        writers
            .entry(normalize_path(&step.file_path))
            .or_default()
            .push(step.id.clone());
    }
    writers
        .into_iter()
        .filter(|(_, steps)| steps.len() > 1)
        .map(|(path, steps)| FileConflict { path, steps })
        .collect()
}
