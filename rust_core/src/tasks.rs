//! Task structure of multi-task data: which task indices occur and how often.

use crate::error::{BnnError, Result};
use ndarray::{ArrayView1, ArrayViewD, Ix1};
use std::collections::BTreeMap;

/// Row counts per task index, ordered by index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskStructure {
    sizes: BTreeMap<i64, usize>,
}

impl TaskStructure {
    /// Build from a column of task indices stored as floats.
    pub fn from_column(column: ArrayView1<f64>) -> Result<Self> {
        let mut sizes = BTreeMap::new();
        for &v in column.iter() {
            *sizes.entry(task_index(v)?).or_insert(0) += 1;
        }
        Ok(Self { sizes })
    }

    pub fn tasks(&self) -> impl Iterator<Item = i64> + '_ {
        self.sizes.keys().copied()
    }

    pub fn size(&self, task: i64) -> Option<usize> {
        self.sizes.get(&task).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn contains(&self, task: i64) -> bool {
        self.sizes.contains_key(&task)
    }

    /// Fail on the first task of `other` that this structure has not seen.
    pub fn check_known(&self, other: &TaskStructure) -> Result<()> {
        match other.tasks().find(|t| !self.contains(*t)) {
            Some(task) => Err(BnnError::UnseenTask {
                task,
                known: self.tasks().collect(),
            }),
            None => Ok(()),
        }
    }

    /// String-keyed view, e.g. `{"0": 3, "1": 2}`.
    pub fn to_string_keys(&self) -> BTreeMap<String, usize> {
        self.sizes.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }
}

/// Task indices must be non-negative integers.
pub(crate) fn task_index(v: f64) -> Result<i64> {
    if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
        return Err(BnnError::InvalidConfig(format!(
            "task index must be a non-negative integer, got {v}"
        )));
    }
    Ok(v as i64)
}

/// Count rows per task in a one-dimensional array of task indices.
///
/// ```
/// use ndarray::array;
/// use partial_bnn_core::tasks::compute_task_sizes;
///
/// let idx = array![0., 0., 0., 1., 1., 3., 3., 3., 3., 3., 3., 5., 5.];
/// let sizes = compute_task_sizes(idx.view().into_dyn()).unwrap();
/// assert_eq!(sizes["3"], 6);
/// ```
pub fn compute_task_sizes(indices: ArrayViewD<f64>) -> Result<BTreeMap<String, usize>> {
    let shape = indices.shape().to_vec();
    let column = indices
        .into_dimensionality::<Ix1>()
        .map_err(|_| BnnError::shape("task indices", "1-D array", &shape))?;
    Ok(TaskStructure::from_column(column)?.to_string_keys())
}
