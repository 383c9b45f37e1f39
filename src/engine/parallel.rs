//! Multi-worker map phase.
//!
//! The documents are split into contiguous partitions, one per worker. Each
//! worker maps its partition into its own [`MapResult`] bucket and the
//! buckets are merged by partition index, so rows sharing a key keep the
//! order of the document list.

use dashmap::DashMap;
use itertools::Itertools;
use std::sync::Arc;

use super::{map_document, MapResult, ViewError};
use crate::store::Document;
use crate::MapFn;

type PartitionIndex = usize;
type Buckets = DashMap<PartitionIndex, MapResult>;

/// Map `docs` on up to `workers` threads.
pub fn map_partitioned(
    map: &MapFn,
    docs: &[Arc<Document>],
    workers: usize,
) -> Result<MapResult, ViewError> {
    let workers = workers.max(1);
    if workers == 1 || docs.len() < 2 {
        let mut mapped = MapResult::new();
        for doc in docs {
            map_document(map, doc, &mut mapped)?;
        }
        return Ok(mapped);
    }

    let partition_size = docs.len().div_ceil(workers);
    let buckets = Buckets::new();
    std::thread::scope(|scope| -> Result<(), ViewError> {
        let handles = docs
            .chunks(partition_size)
            .enumerate()
            .map(|(index, partition)| {
                let buckets = &buckets;
                scope.spawn(move || -> Result<(), ViewError> {
                    let mut mapped = MapResult::new();
                    for doc in partition {
                        map_document(map, doc, &mut mapped)?;
                    }
                    buckets.insert(index, mapped);
                    Ok(())
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().map_err(|_| ViewError::WorkerPanicked)??;
        }
        Ok(())
    })?;

    tracing::trace!(partitions = buckets.len(), "merging map partitions");
    let mut merged = MapResult::new();
    for index in buckets.iter().map(|entry| *entry.key()).sorted() {
        if let Some((_, partial)) = buckets.remove(&index) {
            merged.append(partial);
        }
    }
    Ok(merged)
}
