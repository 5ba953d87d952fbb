use crate::result::{PreprocessError, PreprocessResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Receives the completion of the batch in `[0, 1]`.
/// Returning `true` cancels the batch, in which case no tileset descriptor is written.
pub type ProgressCallback<'a> = dyn Fn(f64) -> bool + Sync + 'a;

/// Reports the progress of a fixed number of steps and remembers cancellation.
pub(crate) struct CountingProgressCallback<'a> {
    count: f64,
    counter: AtomicU64,
    cancelled: AtomicBool,
    progress_callback: Option<&'a ProgressCallback<'a>>,
}

impl<'a> CountingProgressCallback<'a> {
    pub(crate) fn new(count: u64, progress_callback: Option<&'a ProgressCallback<'a>>) -> Self {
        Self {
            count: count.max(1) as f64,
            counter: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            progress_callback,
        }
    }

    fn report(&self, completion: f64) -> PreprocessResult<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(PreprocessError::Cancelled);
        }

        if let Some(progress_callback) = self.progress_callback {
            if progress_callback(completion.min(1.0)) {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(PreprocessError::Cancelled);
            }
        }

        Ok(())
    }

    /// Marks one step as done.
    pub(crate) fn increment(&self) -> PreprocessResult<()> {
        let done = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.report(done as f64 / self.count)
    }

    /// Polls for cancellation in the middle of a step, `fraction` of which is done.
    pub(crate) fn poll(&self, fraction: f64) -> PreprocessResult<()> {
        let done = self.counter.load(Ordering::Relaxed) as f64;
        self.report((done + fraction.clamp(0.0, 1.0)) / self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn completion_is_reported_per_step() {
        let reports = Mutex::new(Vec::new());
        let callback: &ProgressCallback = &|completion: f64| {
            reports.lock().unwrap().push(completion);
            false
        };

        let progress = CountingProgressCallback::new(4, Some(callback));
        progress.increment().unwrap();
        progress.poll(0.5).unwrap();
        progress.increment().unwrap();

        assert_eq!(*reports.lock().unwrap(), vec![0.25, 0.375, 0.5]);
    }

    #[test]
    fn cancellation_sticks() {
        let callback: &ProgressCallback = &|completion: f64| completion >= 0.5;
        let progress = CountingProgressCallback::new(4, Some(callback));

        assert!(progress.increment().is_ok());
        assert!(matches!(progress.increment(), Err(PreprocessError::Cancelled)));
        assert!(matches!(progress.poll(0.0), Err(PreprocessError::Cancelled)));
    }
}
