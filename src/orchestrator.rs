//! Bounded-concurrency fetching of per-course data.
//!
//! The portal keeps per-session view state on the server; two overlapping
//! enter-and-navigate sequences against the same session silently corrupt
//! each other. Every multi-request sequence therefore runs under an
//! explicit queue-of-one gate, while completed results stream back to the
//! caller in completion order rather than submission order.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::course::{Course, Frequency, Grade};

/// Mutual-exclusion gate serializing navigation sequences against one
/// session. Dropping a holder's future mid-sequence releases the gate, so
/// cancellation never deadlocks queued work.
#[derive(Clone, Default)]
pub struct NavigationGate {
    inner: Arc<Mutex<()>>,
}

impl NavigationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the gate for the duration of one navigation sequence.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.inner.clone().lock_owned().await
    }
}

/// Everything fetched for one course. `frequency` is `None` when that
/// sub-fetch failed or was not requested.
#[derive(Debug, Clone, Serialize)]
pub struct CourseData {
    /// Index of the course in the submitted batch.
    pub index: usize,
    pub title: String,
    pub grades: Vec<Grade>,
    pub frequency: Option<Frequency>,
}

/// Fetches a batch of courses' data under the one-at-a-time constraint.
#[derive(Default)]
pub struct Orchestrator {
    gate: NavigationGate,
    include_frequency: bool,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also fetch each course's attendance summary.
    pub fn with_frequency(mut self) -> Self {
        self.include_frequency = true;
        self
    }

    pub fn gate(&self) -> &NavigationGate {
        &self.gate
    }

    /// Fetch data for every course, yielding results as each completes.
    ///
    /// `priority` lists batch indices to attempt first; it reorders
    /// submission only and never relaxes the one-at-a-time constraint. A
    /// course whose grade fetch fails is omitted from the results rather
    /// than aborting the batch.
    pub fn stream(
        &self,
        courses: &[Course],
        priority: &[usize],
    ) -> impl Stream<Item = CourseData> + use<> {
        let include_frequency = self.include_frequency;
        let futures: FuturesUnordered<_> = submission_order(courses.len(), priority)
            .into_iter()
            .map(|index| {
                let course = courses[index].clone();
                let gate = self.gate.clone();
                async move {
                    let _guard = gate.acquire().await;
                    fetch_one(index, course, include_frequency).await
                }
            })
            .collect();
        futures.filter_map(|item| async move { item })
    }

    /// Collect the whole batch, honoring cancellation. Cancelling mid-batch
    /// drops the in-flight sequence (releasing the gate) and returns
    /// whatever completed so far.
    pub async fn collect(
        &self,
        courses: &[Course],
        priority: &[usize],
        cancel: &CancellationToken,
    ) -> Vec<CourseData> {
        let mut results = Vec::new();
        let stream = self.stream(courses, priority);
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(completed = results.len(), "course batch cancelled");
                    break;
                }
                next = stream.next() => match next {
                    Some(data) => results.push(data),
                    None => break,
                }
            }
        }
        results
    }
}

/// One gated enter-and-navigate sequence. Per-course failures are swallowed
/// here so one bad course never aborts its siblings.
async fn fetch_one(index: usize, course: Course, include_frequency: bool) -> Option<CourseData> {
    let grades = match course.fetch_grades().await {
        Ok(grades) => grades,
        Err(error) => {
            warn!(course = course.title(), %error, "grade fetch failed, omitting course");
            return None;
        }
    };
    let frequency = if include_frequency {
        match course.fetch_frequency().await {
            Ok(frequency) => Some(frequency),
            Err(error) => {
                debug!(course = course.title(), %error, "frequency fetch failed, omitting it");
                None
            }
        }
    } else {
        None
    };
    Some(CourseData {
        index,
        title: course.title().to_owned(),
        grades,
        frequency,
    })
}

/// Prioritized indices first (in batch order), then the rest in batch
/// order. Out-of-range priority entries are dropped.
pub(crate) fn submission_order(len: usize, priority: &[usize]) -> Vec<usize> {
    let (mut first, mut rest): (Vec<usize>, Vec<usize>) =
        (0..len).partition(|index| priority.contains(index));
    first.append(&mut rest);
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    #[test]
    fn priority_reorders_submission_only() {
        assert_eq!(submission_order(4, &[]), vec![0, 1, 2, 3]);
        assert_eq!(submission_order(4, &[2, 3]), vec![2, 3, 0, 1]);
        assert_eq!(submission_order(3, &[9]), vec![0, 1, 2]);
        assert_eq!(submission_order(0, &[1]), Vec::<usize>::new());
    }

    /// Spawn overlapping gated sequences and assert their instrumented
    /// spans never overlap.
    #[tokio::test]
    async fn gate_serializes_sequences() {
        let gate = NavigationGate::new();
        let spans: Arc<StdMutex<Vec<(Instant, Instant)>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let spans = Arc::clone(&spans);
            handles.push(tokio::spawn(async move {
                let _guard = gate.acquire().await;
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(10)).await;
                spans.lock().unwrap().push((start, Instant::now()));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 4);
        let mut sorted: Vec<_> = spans.clone();
        sorted.sort_by_key(|(start, _)| *start);
        for pair in sorted.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "navigation sequences overlapped under the gate"
            );
        }
    }

    /// A cancelled holder must release the gate for queued work.
    #[tokio::test]
    async fn cancellation_releases_the_gate() {
        let gate = NavigationGate::new();

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _guard = gate.acquire().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        // Give the holder time to take the gate, then cancel it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.abort();
        let _ = holder.await;

        let acquired =
            tokio::time::timeout(Duration::from_secs(1), gate.acquire()).await;
        assert!(acquired.is_ok(), "gate stayed locked after cancellation");
    }
}
