//! In-memory partitioned execution of [`Dataset`] plans.
//!
//! [`LocalEngine`] walks a [`LogicalPlan`] bottom-up and processes every partition
//! as an independent rayon task. It is the reference collaborator used by the CLI
//! and the tests; any engine with the same operators (outer explode, equi-join,
//! grouped counts, preview-then-map) can execute the plans this crate produces.
//!
//! ## Preview-then-map
//!
//! Some row-level computations need a summary of the *whole* dataset first. The
//! membership check is the canonical example: it gathers every distinct coding,
//! asks the terminology service once, and only then decides row membership. This
//! is modelled as a [`PreviewMapper`]:
//!
//! 1. `preview_partition` runs once per partition, in parallel.
//! 2. `merge` combines the partial results. It must be associative and
//!    commutative so the outcome is independent of partitioning and row order.
//! 3. `finish` runs exactly once, after every partition has been previewed.
//! 4. `call` maps each row using the finished state, in parallel.
//!
//! [`MemoizedStage`] adapts a mapper to the object-safe [`PreviewStage`] stored in
//! the plan and memoises the finished state, so a stage referenced more than once
//! in a plan only previews once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, trace};

use crate::dataset::{Column, Dataset, JoinType, LogicalPlan, Partition, Row};
use atrius_fhirpath_support::evaluation_error::{EvaluationError, EvaluationResult, check_present};

/// A row mapping that needs a full-dataset summary before it can run.
pub trait PreviewMapper: Send + Sync + fmt::Debug {
    /// Per-partition summary.
    type Partial: Default + Send;
    /// Summary shared by every row-level call once the preview is finished.
    type State: Send + Sync + fmt::Debug;

    fn preview_partition(&self, values: &[Value]) -> Self::Partial;

    fn merge(&self, left: Self::Partial, right: Self::Partial) -> Self::Partial;

    /// Turns the merged summary into the shared state. Runs once.
    fn finish(&self, partial: Self::Partial) -> EvaluationResult<Self::State>;

    fn call(&self, state: &Self::State, value: &Value) -> Value;
}

/// Object-safe view of a preview-then-map stage, as stored in a [`LogicalPlan`].
pub trait PreviewStage: Send + Sync + fmt::Debug {
    /// Previews every partition and finishes the state, unless that already happened.
    fn prepare(&self, partitions: &[Vec<Value>]) -> EvaluationResult<()>;

    /// Maps one value. Fails if [`PreviewStage::prepare`] has not completed.
    fn call(&self, value: &Value) -> EvaluationResult<Value>;
}

/// A [`PreviewStage`] that runs its mapper's preview at most once.
#[derive(Debug)]
pub struct MemoizedStage<M: PreviewMapper> {
    mapper: M,
    state: OnceCell<Arc<M::State>>,
}

impl<M: PreviewMapper> MemoizedStage<M> {
    pub fn new(mapper: M) -> Self {
        Self {
            mapper,
            state: OnceCell::new(),
        }
    }
}

impl<M: PreviewMapper> PreviewStage for MemoizedStage<M> {
    fn prepare(&self, partitions: &[Vec<Value>]) -> EvaluationResult<()> {
        self.state.get_or_try_init(|| {
            debug!(partitions = partitions.len(), "Previewing dataset");
            let partial = partitions
                .par_iter()
                .map(|values| self.mapper.preview_partition(values))
                .reduce(<M::Partial as Default>::default, |left, right| {
                    self.mapper.merge(left, right)
                });
            self.mapper.finish(partial).map(Arc::new)
        })?;
        Ok(())
    }

    fn call(&self, value: &Value) -> EvaluationResult<Value> {
        let state = check_present(self.state.get(), "preview state")?;
        Ok(self.mapper.call(state, value))
    }
}

/// Executes plans over in-memory partitions using rayon.
#[derive(Debug, Clone, Default)]
pub struct LocalEngine {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl LocalEngine {
    /// An engine running on rayon's global thread pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine running on a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> EvaluationResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| EvaluationError::Invariant(format!("failed to build thread pool: {}", e)))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Executes `dataset` and returns its partitions.
    pub fn execute(&self, dataset: &Dataset) -> EvaluationResult<Vec<Partition>> {
        match &self.pool {
            Some(pool) => pool.install(|| execute_plan(dataset)),
            None => execute_plan(dataset),
        }
    }

    /// Executes `dataset` and concatenates its partitions.
    pub fn collect(&self, dataset: &Dataset) -> EvaluationResult<Vec<Row>> {
        Ok(self.execute(dataset)?.into_iter().flatten().collect())
    }
}

fn execute_plan(dataset: &Dataset) -> EvaluationResult<Vec<Partition>> {
    match dataset.plan() {
        LogicalPlan::Scan { partitions } => {
            trace!(partitions = partitions.len(), "Scan");
            Ok(partitions.as_ref().clone())
        }
        LogicalPlan::WithColumn {
            input,
            alias,
            column,
        } => Ok(map_rows(execute_plan(input)?, |mut row| {
            let value = column.evaluate(&row);
            row.insert(alias.clone(), value);
            row
        })),
        LogicalPlan::Select { input, columns } => Ok(map_rows(execute_plan(input)?, |row| {
            columns
                .iter()
                .map(|(alias, column)| (alias.clone(), column.evaluate(&row)))
                .collect()
        })),
        LogicalPlan::Filter { input, predicate } => Ok(execute_plan(input)?
            .into_par_iter()
            .map(|partition| {
                partition
                    .into_iter()
                    .filter(|row| predicate.evaluate(row) == Value::Bool(true))
                    .collect::<Partition>()
            })
            .collect()),
        LogicalPlan::ExplodeOuter {
            input,
            column,
            index_alias,
            value_alias,
        } => Ok(execute_plan(input)?
            .into_par_iter()
            .map(|partition| {
                partition
                    .into_iter()
                    .flat_map(|row| explode_outer(row, column, index_alias, value_alias))
                    .collect::<Partition>()
            })
            .collect()),
        LogicalPlan::Join {
            left,
            right,
            left_on,
            right_on,
            join_type,
        } => {
            let right_rows = execute_plan(right)?;
            let left_rows = execute_plan(left)?;
            Ok(hash_join(left_rows, right_rows, left_on, right_on, *join_type))
        }
        LogicalPlan::Aggregate {
            input,
            group_by,
            count_alias,
            count_of,
        } => Ok(aggregate_count(
            execute_plan(input)?,
            group_by,
            count_alias,
            count_of,
        )),
        LogicalPlan::MapWithPreview {
            input,
            column,
            alias,
            stage,
        } => {
            let partitions = execute_plan(input)?;
            let values: Vec<Vec<Value>> = partitions
                .par_iter()
                .map(|partition| partition.iter().map(|row| column.evaluate(row)).collect())
                .collect();
            stage.prepare(&values)?;
            partitions
                .into_par_iter()
                .zip(values.into_par_iter())
                .map(|(partition, values)| {
                    partition
                        .into_iter()
                        .zip(values.iter())
                        .map(|(mut row, value)| {
                            row.insert(alias.clone(), stage.call(value)?);
                            Ok(row)
                        })
                        .collect::<EvaluationResult<Partition>>()
                })
                .collect()
        }
    }
}

fn map_rows<F>(partitions: Vec<Partition>, f: F) -> Vec<Partition>
where
    F: Fn(Row) -> Row + Send + Sync,
{
    partitions
        .into_par_iter()
        .map(|partition| partition.into_iter().map(&f).collect())
        .collect()
}

fn explode_outer(row: Row, column: &Column, index_alias: &str, value_alias: &str) -> Vec<Row> {
    let elements = match column.evaluate(&row) {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        scalar => vec![scalar],
    };
    if elements.is_empty() {
        let mut out = row;
        out.insert(index_alias.to_string(), Value::Null);
        out.insert(value_alias.to_string(), Value::Null);
        return vec![out];
    }
    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            let mut out = row.clone();
            out.insert(index_alias.to_string(), Value::from(index as u64));
            out.insert(value_alias.to_string(), element);
            out
        })
        .collect()
}

fn join_key(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn hash_join(
    left: Vec<Partition>,
    right: Vec<Partition>,
    left_on: &str,
    right_on: &str,
    join_type: JoinType,
) -> Vec<Partition> {
    let mut broadcast: HashMap<String, Vec<Row>> = HashMap::new();
    for row in right.into_iter().flatten() {
        if let Some(key) = join_key(row.get(right_on)) {
            broadcast.entry(key).or_default().push(row);
        }
    }
    left.into_par_iter()
        .map(|partition| {
            let mut out = Vec::with_capacity(partition.len());
            for row in partition {
                let matches = join_key(row.get(left_on)).and_then(|key| broadcast.get(&key));
                match matches {
                    Some(matches) => {
                        for matched in matches {
                            let mut joined = row.clone();
                            for (name, value) in matched {
                                joined.insert(name.clone(), value.clone());
                            }
                            out.push(joined);
                        }
                    }
                    None if join_type == JoinType::Left => out.push(row),
                    None => {}
                }
            }
            out
        })
        .collect()
}

fn aggregate_count(
    partitions: Vec<Partition>,
    group_by: &str,
    count_alias: &str,
    count_of: &Column,
) -> Vec<Partition> {
    let partition_count = partitions.len().max(1);
    let merged = partitions
        .par_iter()
        .map(|partition| {
            let mut counts: HashMap<String, (Value, u64)> = HashMap::new();
            for row in partition {
                let Some(key) = join_key(row.get(group_by)) else {
                    continue;
                };
                let present = !count_of.evaluate(row).is_null();
                let entry = counts
                    .entry(key)
                    .or_insert_with(|| (row.get(group_by).cloned().unwrap_or(Value::Null), 0));
                if present {
                    entry.1 += 1;
                }
            }
            counts
        })
        .reduce(HashMap::new, |mut left, right| {
            for (key, (value, count)) in right {
                left.entry(key).or_insert((value, 0)).1 += count;
            }
            left
        });

    let mut groups: Vec<_> = merged.into_iter().collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out: Vec<Partition> = vec![Vec::new(); partition_count];
    for (ordinal, (_, (key, count))) in groups.into_iter().enumerate() {
        let mut row = Row::new();
        row.insert(group_by.to_string(), key);
        row.insert(count_alias.to_string(), Value::from(count));
        out[ordinal % partition_count].push(row);
    }
    out
}
