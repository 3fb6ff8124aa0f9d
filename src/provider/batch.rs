use std::future::Future;

use futures::stream::{self, StreamExt};

use super::{BatchFailure, BatchReport, StorageError};

/// Items dispatched concurrently by the default batch operations.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// Run `op` over every id with bounded concurrency and wait for all of them.
///
/// Returns `Ok` only when every item succeeded; otherwise the full report is
/// carried in [`StorageError::PartialBatchFailure`]. Report order follows `ids`.
pub(crate) async fn run<F, Fut, T>(
    ids: &[String],
    concurrency: usize,
    op: F,
) -> Result<BatchReport, StorageError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut outcomes: Vec<(usize, String, Result<T, StorageError>)> =
        stream::iter(ids.iter().cloned().enumerate())
            .map(|(index, id)| {
                let pending = op(id.clone());
                async move { (index, id, pending.await) }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut report = BatchReport::default();
    for (_, id, outcome) in outcomes {
        match outcome {
            Ok(_) => report.succeeded.push(id),
            Err(error) => {
                tracing::warn!(item_id = %id, error = %error, "Batch item failed");
                report.failed.push(BatchFailure { id, error });
            }
        }
    }

    if report.is_complete_success() {
        Ok(report)
    } else {
        Err(StorageError::PartialBatchFailure(report))
    }
}
