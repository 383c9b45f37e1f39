//! The chunked map/reduce engine.
//!
//! A [`MapReduceJob`] is a state machine over a fixed list of documents:
//!
//! ```text
//! Idle -> Mapping -> (MapDone | Reducing) -> Finished
//! ```
//!
//! Each call to [`MapReduceJob::step`] processes at most one chunk of
//! documents (or of keys, while reducing) and then returns
//! [`Step::Yield`] so the caller can hand control back to its event loop.
//! [`drive`] runs a job to completion, awaiting a [`Scheduler`] between
//! chunks.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! # use serde_json::json;
//! use tagcouch::engine::{drive, JobOutput, MapReduceJob, YieldNow};
//! use tagcouch::{Document, Emitter, MapFn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let docs = vec![
//!     Arc::new(Document::from_value(json!({"id": "a", "title": "Persona"}))?),
//!     Arc::new(Document::from_value(json!({"id": "b", "title": "Maps"}))?),
//! ];
//! let map: MapFn = Arc::new(|doc: &Document, emit: &mut Emitter| {
//!     emit.emit(doc.str_field("title").unwrap_or_default(), 1);
//!     Ok(())
//! });
//! let job = MapReduceJob::new(map, None, docs, 1000);
//! let JobOutput::Mapped(mapped) = drive(job, &YieldNow, None).await? else {
//!     unreachable!()
//! };
//! assert_eq!(mapped.len(), 2);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::store::Document;
use crate::{EmittedRow, Key, MapFn, ReduceFn, ReducedRow};

pub mod parallel;

/// Documents (or keys) processed between two yields unless configured
/// otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default pause between chunks.
pub const DEFAULT_BREATHE: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("Map function failed on document `{id}`: {error:#}")]
    Map { id: String, error: anyhow::Error },
    #[error("Reduce function failed on key {key:?}: {error:#}")]
    Reduce { key: Key, error: anyhow::Error },
    #[error("A map worker panicked")]
    WorkerPanicked,
    #[error("The job has already finished")]
    Finished,
}

/////////////////////////////////////////////////////////////////////////////
// Emitting rows
/////////////////////////////////////////////////////////////////////////////

/// Collects the rows a map function emits for one document.
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Key, Value)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one row for the document being mapped.
    pub fn emit(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.rows.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn drain(&mut self) -> std::vec::Drain<'_, (Key, Value)> {
        self.rows.drain(..)
    }
}

/// Rows grouped by key, keys ascending, rows of one key in emission order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapResult {
    groups: BTreeMap<Key, Vec<(String, Value)>>,
    rows: usize,
}

impl MapResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: impl Into<String>, key: Key, value: Value) {
        self.groups
            .entry(key)
            .or_default()
            .push((id.into(), value));
        self.rows += 1;
    }

    /// Move every row of `other` after the rows already held for its key.
    pub fn append(&mut self, other: MapResult) {
        for (key, rows) in other.groups {
            self.groups.entry(key).or_default().extend(rows);
        }
        self.rows += other.rows;
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.groups.keys()
    }

    pub fn group(&self, key: &Key) -> Option<&[(String, Value)]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&Key, &[(String, Value)])> {
        self.groups.iter().map(|(key, rows)| (key, rows.as_slice()))
    }

    /// Values of `key`, in emission order.
    pub fn values(&self, key: &Key) -> Vec<Value> {
        self.groups
            .get(key)
            .map(|rows| rows.iter().map(|(_, value)| value.clone()).collect())
            .unwrap_or_default()
    }

    /// The rows in view order.
    pub fn into_rows(self) -> Vec<EmittedRow> {
        self.groups
            .into_iter()
            .flat_map(|(key, rows)| {
                rows.into_iter().map(move |(id, value)| EmittedRow {
                    id,
                    key: key.clone(),
                    value,
                })
            })
            .collect()
    }
}

/// Apply `map` to one document, recording its rows under its id.
/// Tombstones are not mapped.
pub fn map_document(map: &MapFn, doc: &Document, out: &mut MapResult) -> Result<(), ViewError> {
    if doc.deleted {
        return Ok(());
    }
    let mut emitter = Emitter::new();
    map(doc, &mut emitter).map_err(|error| ViewError::Map {
        id: doc.id.clone(),
        error,
    })?;
    for (key, value) in emitter.drain() {
        out.push(doc.id.as_str(), key, value);
    }
    Ok(())
}

/// Call a user reduce function.
///
/// With `rereduce` set, `values` are outputs of earlier reduce calls.
pub fn reduce_rows(
    reduce: &ReduceFn,
    key: &Key,
    values: &[Value],
    rereduce: bool,
) -> Result<Value, ViewError> {
    reduce(key, values, rereduce).map_err(|error| ViewError::Reduce {
        key: key.clone(),
        error,
    })
}

/////////////////////////////////////////////////////////////////////////////
// The state machine
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Mapping,
    MapDone,
    Reducing,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

/// How the map phase spreads documents over threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MapStrategy {
    #[default]
    SingleThreaded,
    /// Each chunk is split into `workers` contiguous partitions.
    Parallel { workers: usize },
}

#[derive(Debug)]
pub enum JobOutput {
    Mapped(MapResult),
    Reduced {
        mapped: MapResult,
        rows: Vec<ReducedRow>,
    },
}

impl JobOutput {
    pub fn mapped(&self) -> &MapResult {
        match self {
            JobOutput::Mapped(mapped) => mapped,
            JobOutput::Reduced { mapped, .. } => mapped,
        }
    }
}

#[derive(Debug)]
pub enum Step {
    /// A chunk boundary. `fraction` of the current phase is done.
    Yield { phase: Phase, fraction: f64 },
    Done(JobOutput),
}

pub struct MapReduceJob {
    map: MapFn,
    reduce: Option<ReduceFn>,
    docs: Vec<Arc<Document>>,
    chunk_size: usize,
    strategy: MapStrategy,
    state: JobState,
    cursor: usize,
    mapped: MapResult,
    keys: Vec<Key>,
    reduced: Vec<ReducedRow>,
}

impl MapReduceJob {
    /// A chunk size of zero is treated as one.
    pub fn new(
        map: MapFn,
        reduce: Option<ReduceFn>,
        docs: Vec<Arc<Document>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            map,
            reduce,
            docs,
            chunk_size: chunk_size.max(1),
            strategy: MapStrategy::default(),
            state: JobState::Idle,
            cursor: 0,
            mapped: MapResult::new(),
            keys: Vec::new(),
            reduced: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: MapStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run until the next chunk boundary or the end of the job.
    ///
    /// A map or reduce error finishes the job.
    pub fn step(&mut self) -> Result<Step, ViewError> {
        let result = self.advance();
        if result.is_err() {
            self.state = JobState::Finished;
        }
        result
    }

    fn advance(&mut self) -> Result<Step, ViewError> {
        loop {
            match self.state {
                JobState::Idle => self.state = JobState::Mapping,
                JobState::Mapping => {
                    let end = (self.cursor + self.chunk_size).min(self.docs.len());
                    self.map_chunk(self.cursor, end)?;
                    self.cursor = end;
                    if self.cursor < self.docs.len() {
                        return Ok(Step::Yield {
                            phase: Phase::Map,
                            fraction: self.cursor as f64 / self.docs.len() as f64,
                        });
                    }
                    tracing::trace!(rows = self.mapped.len(), "map phase done");
                    if self.reduce.is_some() {
                        self.keys = self.mapped.keys().cloned().collect();
                        self.cursor = 0;
                        self.state = JobState::Reducing;
                    } else {
                        self.state = JobState::MapDone;
                    }
                }
                JobState::MapDone => {
                    self.state = JobState::Finished;
                    let mapped = std::mem::take(&mut self.mapped);
                    return Ok(Step::Done(JobOutput::Mapped(mapped)));
                }
                JobState::Reducing => {
                    let Some(reduce) = self.reduce.clone() else {
                        self.state = JobState::MapDone;
                        continue;
                    };
                    let end = (self.cursor + self.chunk_size).min(self.keys.len());
                    for key in &self.keys[self.cursor..end] {
                        let values = self.mapped.values(key);
                        let value = reduce_rows(&reduce, key, &values, false)?;
                        self.reduced.push(ReducedRow::new(key.clone(), value));
                    }
                    self.cursor = end;
                    if self.cursor < self.keys.len() {
                        return Ok(Step::Yield {
                            phase: Phase::Reduce,
                            fraction: self.cursor as f64 / self.keys.len() as f64,
                        });
                    }
                    self.state = JobState::Finished;
                    return Ok(Step::Done(JobOutput::Reduced {
                        mapped: std::mem::take(&mut self.mapped),
                        rows: std::mem::take(&mut self.reduced),
                    }));
                }
                JobState::Finished => return Err(ViewError::Finished),
            }
        }
    }

    fn map_chunk(&mut self, start: usize, end: usize) -> Result<(), ViewError> {
        let chunk = &self.docs[start..end];
        match self.strategy {
            MapStrategy::Parallel { workers } if workers > 1 => {
                let partial = parallel::map_partitioned(&self.map, chunk, workers)?;
                self.mapped.append(partial);
            }
            _ => {
                for doc in chunk {
                    map_document(&self.map, doc, &mut self.mapped)?;
                }
            }
        }
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Driving a job
/////////////////////////////////////////////////////////////////////////////

/// Progress callback, called at every chunk boundary.
pub type ProgressFn = Arc<dyn Fn(Phase, f64) + Send + Sync>;

/// Decides how long a job pauses at a chunk boundary.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn resume(&self, phase: Phase, fraction: f64);
}

/// Sleeps for a fixed duration between chunks.
#[derive(Clone, Copy, Debug)]
pub struct Breathe(pub Duration);

impl Default for Breathe {
    fn default() -> Self {
        Breathe(DEFAULT_BREATHE)
    }
}

#[async_trait]
impl Scheduler for Breathe {
    async fn resume(&self, _phase: Phase, _fraction: f64) {
        tokio::time::sleep(self.0).await;
    }
}

/// Yields to the runtime once between chunks.
#[derive(Clone, Copy, Debug, Default)]
pub struct YieldNow;

#[async_trait]
impl Scheduler for YieldNow {
    async fn resume(&self, _phase: Phase, _fraction: f64) {
        tokio::task::yield_now().await;
    }
}

/// Run `job` to completion.
pub async fn drive(
    mut job: MapReduceJob,
    scheduler: &dyn Scheduler,
    progress: Option<&ProgressFn>,
) -> Result<JobOutput, ViewError> {
    loop {
        match job.step()? {
            Step::Yield { phase, fraction } => {
                tracing::trace!(%phase, fraction, "chunk done");
                if let Some(progress) = progress {
                    progress(phase, fraction);
                }
                scheduler.resume(phase, fraction).await;
            }
            Step::Done(output) => return Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn docs(n: usize) -> Vec<Arc<Document>> {
        (1..=n)
            .map(|nr| Arc::new(Document::from_value(json!({"id": format!("doc{nr}"), "nr": nr})).unwrap()))
            .collect()
    }

    fn parity() -> MapFn {
        Arc::new(|doc: &Document, emit: &mut Emitter| {
            let nr = doc.fields["nr"].as_i64().unwrap_or_default();
            emit.emit(if nr % 2 == 0 { "even" } else { "odd" }, nr);
            Ok(())
        })
    }

    fn sum() -> ReduceFn {
        Arc::new(|_key: &Key, values: &[Value], _rereduce: bool| {
            Ok(json!(values.iter().filter_map(Value::as_i64).sum::<i64>()))
        })
    }

    #[test]
    fn map_only_job_yields_between_chunks() {
        let mut job = MapReduceJob::new(parity(), None, docs(5), 2);
        assert_eq!(job.state(), JobState::Idle);

        let mut fractions = Vec::new();
        let output = loop {
            match job.step().unwrap() {
                Step::Yield { phase, fraction } => {
                    assert_eq!(phase, Phase::Map);
                    assert_eq!(job.state(), JobState::Mapping);
                    fractions.push(fraction);
                }
                Step::Done(output) => break output,
            }
        };
        assert_eq!(fractions, vec![0.4, 0.8]);
        assert_eq!(job.state(), JobState::Finished);

        let JobOutput::Mapped(mapped) = output else {
            panic!("expected map output");
        };
        let rows = mapped.into_rows();
        let ids: Vec<_> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["doc2", "doc4", "doc1", "doc3", "doc5"]);
        assert!(matches!(job.step(), Err(ViewError::Finished)));
    }

    #[test]
    fn reduce_job_yields_per_key_chunk() {
        let mut job = MapReduceJob::new(parity(), Some(sum()), docs(3), 1);
        let mut phases = Vec::new();
        let output = loop {
            match job.step().unwrap() {
                Step::Yield { phase, .. } => phases.push(phase),
                Step::Done(output) => break output,
            }
        };
        assert_eq!(phases, vec![Phase::Map, Phase::Map, Phase::Reduce]);
        let JobOutput::Reduced { rows, mapped } = output else {
            panic!("expected reduce output");
        };
        assert_eq!(mapped.len(), 3);
        assert_eq!(
            rows,
            vec![
                ReducedRow::new("even".into(), json!(2)),
                ReducedRow::new("odd".into(), json!(4)),
            ]
        );
    }

    #[test]
    fn empty_input_finishes_at_once() {
        let mut job = MapReduceJob::new(parity(), Some(sum()), Vec::new(), 0);
        match job.step().unwrap() {
            Step::Done(JobOutput::Reduced { rows, .. }) => assert!(rows.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tombstones_are_not_mapped() {
        let mut all = docs(2);
        all.push(Arc::new(Document::tombstone("doc3")));
        let mut job = MapReduceJob::new(parity(), None, all, 10);
        let Step::Done(output) = job.step().unwrap() else {
            panic!("one chunk is enough");
        };
        assert_eq!(output.mapped().len(), 2);
    }

    #[test]
    fn map_errors_abort_the_job() {
        let map: MapFn = Arc::new(|doc: &Document, _emit: &mut Emitter| {
            anyhow::ensure!(doc.id != "doc2", "cannot map {}", doc.id);
            Ok(())
        });
        let mut job = MapReduceJob::new(map, None, docs(3), 10);
        match job.step() {
            Err(ViewError::Map { id, .. }) => assert_eq!(id, "doc2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(job.state(), JobState::Finished);
    }

    #[tokio::test]
    async fn drive_reports_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |phase, fraction| seen.lock().unwrap().push((phase, fraction)))
        };
        let job = MapReduceJob::new(parity(), Some(sum()), docs(4), 2);
        let output = drive(job, &Breathe(Duration::from_millis(1)), Some(&progress))
            .await
            .unwrap();
        assert!(matches!(output, JobOutput::Reduced { .. }));
        assert_eq!(*seen.lock().unwrap(), vec![(Phase::Map, 0.5)]);
    }

    #[test]
    fn parallel_strategy_matches_single_threaded() {
        let single = MapReduceJob::new(parity(), None, docs(9), 4);
        let parallel = MapReduceJob::new(parity(), None, docs(9), 4)
            .with_strategy(MapStrategy::Parallel { workers: 3 });

        let run = |mut job: MapReduceJob| loop {
            if let Step::Done(output) = job.step().unwrap() {
                break output.mapped().clone();
            }
        };
        assert_eq!(run(single), run(parallel));
    }
}
