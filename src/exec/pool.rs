//! Bounded concurrent runner: executes an ordered list of task thunks with
//! at most `max_concurrent` in flight, populating results at the
//! originating index.

use super::cancel::CancelHandle;
use anyhow::Result;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;

/// Runs every thunk in `tasks`, keeping at most `max_concurrent` started at
/// any moment; as one completes the next queued thunk starts. The returned
/// vector matches the input order regardless of completion order.
///
/// The first task failure fails the whole call; in-flight siblings are
/// dropped, which cancels them at their next suspension point. An aborted
/// `cancel` handle resolves the call early with the cancellation signal.
pub async fn run_bounded<T, F, Fut>(
    tasks: Vec<F>,
    max_concurrent: usize,
    cancel: Option<&CancelHandle>,
) -> Result<Vec<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_concurrent = max_concurrent.max(1);
    let total = tasks.len();
    let mut results: Vec<Option<T>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut queued = tasks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < max_concurrent {
            match queued.next() {
                Some((index, task)) => in_flight.push(async move { (index, task().await) }),
                None => break,
            }
        }

        if in_flight.is_empty() {
            break;
        }

        let completed = match cancel {
            Some(handle) => handle
                .race(in_flight.next())
                .await
                .map_err(anyhow::Error::new)?,
            None => in_flight.next().await,
        };

        match completed {
            Some((index, Ok(value))) => results[index] = Some(value),
            Some((_, Err(err))) => return Err(err),
            None => break,
        }
    }

    Ok(results
        .into_iter()
        .map(|slot| slot.expect("every scheduled task must have completed"))
        .collect())
}
