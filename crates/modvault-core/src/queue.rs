//! Fan-out/fan-in execution of independent units of work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default width: one unit per CPU.
pub fn default_parallelism() -> usize {
    num_cpus::get().max(1)
}

/// Run every unit with at most `parallelism` in flight and wait for all of
/// them. A unit that panics is logged; its siblings still complete.
pub async fn run_all<F>(units: Vec<F>, parallelism: usize)
where
    F: Future<Output = ()> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();
    for unit in units {
        let semaphore = semaphore.clone();
        set.spawn(async move {
            // The semaphore is never closed.
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            unit.await;
        });
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            tracing::error!("Queued operation failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_every_unit_within_the_limit() {
        let done = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let units: Vec<_> = (0..20)
            .map(|_| {
                let done = done.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();

        run_all(units, 3).await;
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn a_panicking_unit_does_not_stop_the_rest() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut units: Vec<std::pin::Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::new();
        units.push(Box::pin(async { panic!("boom") }));
        for _ in 0..3 {
            let done = done.clone();
            units.push(Box::pin(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        run_all(units, 2).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }
}
