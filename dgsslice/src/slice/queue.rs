use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use dgscore::data::histogram::Histogram;
use dgscore::error::{Result, SliceError};

use crate::config::{PolarizedSliceRequest, SliceRequest};
use crate::slice::slicer::Slicer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a job's name and pending count once the job and its callback
/// are done, whichever way they end.
struct JobGuard {
    name: String,
    in_flight: Arc<Mutex<FxHashSet<String>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl JobGuard {
    fn release_name(&self) {
        lock(&self.in_flight).remove(&self.name);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.release_name();
        let (count, idle) = &*self.pending;
        let mut count = lock(count);
        *count -= 1;
        if *count == 0 {
            idle.notify_all();
        }
    }
}

/// Runs slice requests on the rayon pool without blocking the caller.
///
/// At most one job per output name is in flight; results and errors are
/// delivered through callbacks on the worker thread.
pub struct SliceQueue {
    slicer: Arc<Mutex<Slicer>>,
    in_flight: Arc<Mutex<FxHashSet<String>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl SliceQueue {
    pub fn new(slicer: Slicer) -> Self {
        SliceQueue {
            slicer: Arc::new(Mutex::new(slicer)),
            in_flight: Arc::new(Mutex::new(FxHashSet::default())),
            pending: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Shared handle to the slicer, e.g. to read results from its store.
    pub fn slicer(&self) -> Arc<Mutex<Slicer>> {
        self.slicer.clone()
    }

    pub fn is_busy(&self, name: &str) -> bool {
        lock(&self.in_flight).contains(name)
    }

    pub fn submit<S, E>(&self, request: SliceRequest, on_success: S, on_error: E)
    where
        S: FnOnce(Histogram) + Send + 'static,
        E: FnOnce(SliceError) + Send + 'static,
    {
        let name = request.name.clone();
        self.spawn(name, move |slicer| slicer.make_slice(&request), on_success, on_error);
    }

    pub fn submit_polarized<S, E>(&self, request: PolarizedSliceRequest, on_success: S, on_error: E)
    where
        S: FnOnce((Histogram, Histogram)) + Send + 'static,
        E: FnOnce(SliceError) + Send + 'static,
    {
        let name = request.name.clone();
        self.spawn(name, move |slicer| slicer.make_paired_slice(&request), on_success, on_error);
    }

    fn spawn<T, J, S, E>(&self, name: String, job: J, on_success: S, on_error: E)
    where
        T: 'static,
        J: FnOnce(&mut Slicer) -> Result<T> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(SliceError) + Send + 'static,
    {
        if !lock(&self.in_flight).insert(name.clone()) {
            warn!(name = %name, "rejecting slice request, output is already being computed");
            on_error(SliceError::Busy(name));
            return;
        }
        *lock(&self.pending.0) += 1;

        let slicer = self.slicer.clone();
        let guard = JobGuard { name, in_flight: self.in_flight.clone(), pending: self.pending.clone() };
        debug!(name = %guard.name, "queued slice job");

        rayon::spawn(move || {
            let result = {
                let mut slicer = lock(&slicer);
                panic::catch_unwind(AssertUnwindSafe(|| job(&mut slicer))).unwrap_or_else(|_| {
                    Err(SliceError::computation(format!("slice job '{}' panicked", guard.name)))
                })
            };
            guard.release_name();
            if let Err(e) = &result {
                debug!(name = %guard.name, error = %e, "slice job failed");
            }
            match result {
                Ok(value) => on_success(value),
                Err(e) => on_error(e),
            }
            drop(guard);
        });
    }

    /// Blocks until every submitted job has finished and its callback ran.
    pub fn wait_idle(&self) {
        let (count, idle) = &*self.pending;
        let mut count = lock(count);
        while *count > 0 {
            count = idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::config::{DimensionConfig, SliceOptions};
    use crate::store::ArtifactStore;
    use dgscore::data::events::{Dimension, EventSet, Frame, RunInfo, Trajectory};

    fn slicer() -> Slicer {
        let mut events = EventSet::new(
            "data",
            Frame::Sample,
            vec![
                Dimension::momentum("H", -1.0, 1.0),
                Dimension::momentum("K", -1.0, 1.0),
                Dimension::momentum("L", -1.0, 1.0),
            ],
        );
        let run = events.add_run(RunInfo::default());
        events.push_event(&[0.5, 0.0, 0.0], 2.0, 2.0, run, 0);
        events.add_trajectory(Trajectory::new(run, 0, vec![0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0], 4.0));
        let mut store = ArtifactStore::new();
        store.insert_events(events);
        Slicer::new(store)
    }

    fn request(name: &str, data: &str) -> SliceRequest {
        SliceRequest {
            name: name.to_string(),
            data: data.to_string(),
            background: None,
            options: SliceOptions {
                binning: vec![
                    DimensionConfig::new("H", Some("1,0,0"), "0,1"),
                    DimensionConfig::new("K", Some("0,1,0"), "-0.5,0.5"),
                    DimensionConfig::new("L", Some("0,0,1"), "-0.5,0.5"),
                ],
                ..SliceOptions::default()
            },
        }
    }

    #[test]
    fn test_success_and_error_callbacks() {
        let queue = SliceQueue::new(slicer());
        let (tx, rx) = mpsc::channel();
        let tx_err = tx.clone();
        queue.submit(
            request("ok", "data"),
            move |h| tx.send(Ok(h.signal[0])).unwrap(),
            move |e| tx_err.send(Err(e.to_string())).unwrap(),
        );
        let (tx, rx_missing) = mpsc::channel();
        let tx_err = tx.clone();
        queue.submit(
            request("missing", "nowhere"),
            move |h| tx.send(Ok(h.signal[0])).unwrap(),
            move |e| tx_err.send(Err(e.to_string())).unwrap(),
        );
        queue.wait_idle();

        assert_eq!(rx.recv().unwrap(), Ok(0.5));
        assert!(rx_missing.recv().unwrap().unwrap_err().contains("not found"));
        assert!(!queue.is_busy("ok"));
        assert!(queue.slicer().lock().unwrap().store().histogram("ok").is_some());
    }

    #[test]
    fn test_panicking_job_reports_error_and_releases_its_name() {
        let queue = SliceQueue::new(slicer());
        let (tx_err, rx_err) = mpsc::channel();
        queue.spawn(
            "boom".to_string(),
            |_| -> Result<()> { panic!("step failed") },
            |_| panic!("a panicking job cannot succeed"),
            move |e| tx_err.send(e).unwrap(),
        );
        queue.wait_idle();
        let err = rx_err.recv().unwrap();
        assert!(matches!(err, SliceError::Computation(_)));
        assert!(err.to_string().contains("panicked"));
        assert!(!queue.is_busy("boom"));

        let (tx, rx) = mpsc::channel();
        queue.submit(request("boom", "data"), move |h| tx.send(h.signal[0]).unwrap(), |e| panic!("unexpected error {}", e));
        queue.wait_idle();
        assert_eq!(rx.recv().unwrap(), 0.5);
    }

    #[test]
    fn test_second_job_for_same_name_is_busy() {
        let queue = SliceQueue::new(slicer());
        let handle = queue.slicer();
        let guard = handle.lock().unwrap();

        // the first job blocks on the slicer until the guard is dropped
        queue.submit(request("out", "data"), |_| {}, |e| panic!("unexpected error {}", e));
        assert!(queue.is_busy("out"));

        let (tx, rx) = mpsc::channel();
        queue.submit(request("out", "data"), |_| panic!("second job must not run"), move |e| tx.send(e).unwrap());
        assert!(matches!(rx.recv().unwrap(), SliceError::Busy(name) if name == "out"));

        drop(guard);
        queue.wait_idle();
        assert!(!queue.is_busy("out"));
    }
}
