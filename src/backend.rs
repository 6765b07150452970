//! Execution backends for conditioning and filtering.
//!
//! Both operations have a scalar implementation that runs channel after channel on the
//! calling thread and an accelerated one that spreads channels over a dedicated worker
//! pool. The [`Dispatcher`] picks one per call and falls back to the scalar path when
//! the accelerated one fails, so callers only ever see the scalar error modes.

use crate::config::PipelineConfig;
use crate::error::BackendError;
use crate::filters::{filter_scalar, FilterSpec};
use crate::preprocessing::{condition_channel, condition_scalar};
use log::{debug, info, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendKind {
    Scalar,
    Accelerated,
}

/// One implementation of the two heavy pipeline stages.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    fn condition(&self, samples: ArrayView2<i16>) -> Result<Array2<f32>, BackendError>;

    fn filter(&self, data: ArrayView2<f32>, spec: &FilterSpec) -> Result<Array2<f32>, BackendError>;
}

#[derive(Debug, Default)]
pub struct ScalarBackend;

impl ComputeBackend for ScalarBackend {
    fn name(&self) -> &str {
        "scalar"
    }

    fn condition(&self, samples: ArrayView2<i16>) -> Result<Array2<f32>, BackendError> {
        Ok(condition_scalar(samples))
    }

    fn filter(&self, data: ArrayView2<f32>, spec: &FilterSpec) -> Result<Array2<f32>, BackendError> {
        Ok(filter_scalar(data, spec)?)
    }
}

/// A worker pool acquired once per process.
#[derive(Clone)]
pub struct Accelerator {
    name: String,
    pool: Arc<ThreadPool>,
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator").field("name", &self.name).finish()
    }
}

impl Accelerator {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// What the host can run, probed once at startup and passed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Acceleration {
    accelerator: Option<Accelerator>,
    reason: Option<String>,
}

impl Acceleration {
    /// Builds the worker pool. `threads` defaults to the available parallelism.
    /// A single-core host or a pool that fails to start leaves acceleration unavailable.
    pub fn probe(threads: Option<usize>) -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let threads = threads.unwrap_or(available);

        if threads < 2 {
            info!("Acceleration unavailable: {} worker thread(s)", threads);
            return Self::unavailable(format!("{} worker thread(s)", threads));
        }

        match ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ecg-accel-{}", i))
            .build()
        {
            Ok(pool) => {
                let name = format!("parallel pool ({} threads)", threads);
                info!("Acceleration enabled: {}", name);
                Self {
                    accelerator: Some(Accelerator {
                        name,
                        pool: Arc::new(pool),
                    }),
                    reason: None,
                }
            }
            Err(e) => {
                warn!("Acceleration initialization failed: {}", e);
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            accelerator: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.accelerator.is_some()
    }

    pub fn accelerator(&self) -> Option<&Accelerator> {
        self.accelerator.as_ref()
    }

    /// Why acceleration is unavailable, if it is.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Channels processed concurrently on the accelerator's pool.
#[derive(Debug, Clone)]
pub struct ParallelBackend {
    accelerator: Accelerator,
}

impl ParallelBackend {
    pub fn new(accelerator: Accelerator) -> Self {
        Self { accelerator }
    }

    /// Runs `job` on the pool, turning a worker panic into an error.
    fn run<T: Send>(&self, job: impl FnOnce() -> T + Send) -> Result<T, BackendError> {
        catch_unwind(AssertUnwindSafe(|| self.accelerator.pool.install(job))).map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            BackendError::Accelerator(message)
        })
    }
}

impl ComputeBackend for ParallelBackend {
    fn name(&self) -> &str {
        self.accelerator.name()
    }

    fn condition(&self, samples: ArrayView2<i16>) -> Result<Array2<f32>, BackendError> {
        self.run(|| {
            let mut out = Array2::<f32>::zeros(samples.raw_dim());
            out.axis_iter_mut(Axis(1))
                .into_par_iter()
                .zip(samples.axis_iter(Axis(1)).into_par_iter())
                .for_each(|(out_column, column)| condition_channel(column, out_column));
            out
        })
    }

    fn filter(&self, data: ArrayView2<f32>, spec: &FilterSpec) -> Result<Array2<f32>, BackendError> {
        let columns = self.run(|| {
            data.axis_iter(Axis(1))
                .into_par_iter()
                .map(|column| spec.filter_channel(column))
                .collect::<Result<Vec<Vec<f32>>, _>>()
        })??;

        let mut out = Array2::<f32>::zeros(data.raw_dim());
        for (mut out_column, filtered) in out.axis_iter_mut(Axis(1)).zip(columns) {
            for (o, y) in out_column.iter_mut().zip(filtered) {
                *o = y;
            }
        }
        Ok(out)
    }
}

/// A result plus how it was produced.
#[derive(Debug, Clone)]
pub struct Dispatched<T> {
    pub value: T,
    pub backend: BackendKind,
    /// Set when the accelerated path failed and the scalar path produced `value`
    pub fallback: Option<String>,
}

/// Chooses a backend per call.
pub struct Dispatcher {
    scalar: ScalarBackend,
    accelerated: Option<Box<dyn ComputeBackend>>,
    enabled: bool,
    filter_min_rows: usize,
}

impl Dispatcher {
    pub fn new(acceleration: &Acceleration, config: &PipelineConfig) -> Self {
        let accelerated = acceleration
            .accelerator()
            .cloned()
            .map(|a| Box::new(ParallelBackend::new(a)) as Box<dyn ComputeBackend>);
        Self {
            scalar: ScalarBackend,
            accelerated,
            enabled: config.use_acceleration,
            filter_min_rows: config.accelerated_filter_min_rows,
        }
    }

    /// Uses `backend` as the accelerated implementation.
    pub fn with_accelerated(mut self, backend: Box<dyn ComputeBackend>) -> Self {
        self.accelerated = Some(backend);
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn accelerated_available(&self) -> bool {
        self.accelerated.is_some()
    }

    /// The backend a call would start on, before any fallback.
    pub fn active_backend(&self) -> BackendKind {
        if self.enabled && self.accelerated.is_some() {
            BackendKind::Accelerated
        } else {
            BackendKind::Scalar
        }
    }

    fn accelerated_for(&self, rows: Option<usize>) -> Option<&dyn ComputeBackend> {
        if !self.enabled {
            return None;
        }
        if let Some(rows) = rows {
            if rows <= self.filter_min_rows {
                return None;
            }
        }
        self.accelerated.as_deref()
    }

    fn dispatch<T>(
        &self,
        operation: &str,
        accelerated: Option<&dyn ComputeBackend>,
        run: impl Fn(&dyn ComputeBackend) -> Result<T, BackendError>,
    ) -> Result<Dispatched<T>, BackendError> {
        if let Some(backend) = accelerated {
            match run(backend) {
                Ok(value) => {
                    debug!("{} ran on {}", operation, backend.name());
                    return Ok(Dispatched {
                        value,
                        backend: BackendKind::Accelerated,
                        fallback: None,
                    });
                }
                Err(e) => {
                    warn!(
                        "{} failed on {}: {}, falling back to scalar",
                        operation,
                        backend.name(),
                        e
                    );
                    let value = run(&self.scalar)?;
                    return Ok(Dispatched {
                        value,
                        backend: BackendKind::Scalar,
                        fallback: Some(format!("{} failed: {}", backend.name(), e)),
                    });
                }
            }
        }

        let value = run(&self.scalar)?;
        debug!("{} ran on scalar backend", operation);
        Ok(Dispatched {
            value,
            backend: BackendKind::Scalar,
            fallback: None,
        })
    }

    /// Baseline removal and rescale. Accelerated whenever available and enabled.
    pub fn condition(&self, samples: ArrayView2<i16>) -> Result<Dispatched<Array2<f32>>, BackendError> {
        self.dispatch("conditioning", self.accelerated_for(None), |backend| {
            backend.condition(samples)
        })
    }

    /// Band-pass plus notch. Accelerated only above the configured row count.
    pub fn filter(
        &self,
        data: ArrayView2<f32>,
        spec: &FilterSpec,
    ) -> Result<Dispatched<Array2<f32>>, BackendError> {
        self.dispatch(
            "filtering",
            self.accelerated_for(Some(data.nrows())),
            |backend| backend.filter(data, spec),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accelerated stand-in that always fails and counts its calls.
    struct BrokenDevice {
        calls: Arc<AtomicUsize>,
    }

    impl ComputeBackend for BrokenDevice {
        fn name(&self) -> &str {
            "broken device"
        }

        fn condition(&self, _samples: ArrayView2<i16>) -> Result<Array2<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Accelerator("device lost".to_string()))
        }

        fn filter(&self, _data: ArrayView2<f32>, _spec: &FilterSpec) -> Result<Array2<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Accelerator("unsupported operation".to_string()))
        }
    }

    fn raw_samples(rows: usize, channels: usize) -> Array2<i16> {
        Array2::from_shape_fn((rows, channels), |(i, c)| {
            let t = i as f32 / 500.0;
            (800.0 * (2.0 * std::f32::consts::PI * (1.0 + c as f32) * t).sin()) as i16 + 40 * c as i16
        })
    }

    fn pool(threads: usize) -> Accelerator {
        Acceleration::probe(Some(threads))
            .accelerator()
            .cloned()
            .expect("pool with two threads")
    }

    fn assert_close(a: &Array2<f32>, b: &Array2<f32>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-4 * y.abs().max(1.0));
        }
    }

    #[test]
    fn single_thread_probe_is_unavailable() {
        let acceleration = Acceleration::probe(Some(1));
        assert!(!acceleration.is_available());
        assert!(acceleration.reason().is_some());
    }

    #[test]
    fn backends_agree_on_conditioning() {
        let samples = raw_samples(3_000, 4);
        let scalar = ScalarBackend.condition(samples.view()).unwrap();
        let parallel = ParallelBackend::new(pool(2)).condition(samples.view()).unwrap();
        assert_close(&parallel, &scalar);
    }

    #[test]
    fn backends_agree_on_filtering() {
        let spec = FilterSpec::design(500, 50.0, 30.0).unwrap();
        let data = ScalarBackend.condition(raw_samples(12_000, 3).view()).unwrap();
        let scalar = ScalarBackend.filter(data.view(), &spec).unwrap();
        let parallel = ParallelBackend::new(pool(3)).filter(data.view(), &spec).unwrap();
        assert_close(&parallel, &scalar);
    }

    #[test]
    fn parallel_filter_reports_short_segments() {
        let spec = FilterSpec::design(500, 50.0, 30.0).unwrap();
        let data = Array2::<f32>::zeros((10, 2));
        let err = ParallelBackend::new(pool(2)).filter(data.view(), &spec).unwrap_err();
        assert!(matches!(err, BackendError::Filter(_)));
    }

    #[test]
    fn filter_dispatch_respects_row_threshold() {
        let config = PipelineConfig::default();
        let dispatcher = Dispatcher::new(&Acceleration::probe(Some(2)), &config);
        let spec = FilterSpec::design(500, 50.0, 30.0).unwrap();

        let short = Array2::<f32>::zeros((config.accelerated_filter_min_rows, 2));
        assert_eq!(
            dispatcher.filter(short.view(), &spec).unwrap().backend,
            BackendKind::Scalar
        );

        let long = Array2::<f32>::zeros((config.accelerated_filter_min_rows + 1, 2));
        assert_eq!(
            dispatcher.filter(long.view(), &spec).unwrap().backend,
            BackendKind::Accelerated
        );
    }

    #[test]
    fn disabled_acceleration_stays_scalar() {
        let config = PipelineConfig {
            use_acceleration: false,
            ..PipelineConfig::default()
        };
        let mut dispatcher = Dispatcher::new(&Acceleration::probe(Some(2)), &config);
        let samples = raw_samples(100, 2);
        assert_eq!(
            dispatcher.condition(samples.view()).unwrap().backend,
            BackendKind::Scalar
        );

        dispatcher.set_enabled(true);
        assert_eq!(
            dispatcher.condition(samples.view()).unwrap().backend,
            BackendKind::Accelerated
        );
    }

    #[test]
    fn accelerated_failure_falls_back_to_scalar() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(&Acceleration::unavailable("test"), &PipelineConfig::default())
            .with_accelerated(Box::new(BrokenDevice {
                calls: calls.clone(),
            }));

        let samples = raw_samples(20_000, 2);
        let conditioned = dispatcher.condition(samples.view()).unwrap();
        assert_eq!(conditioned.backend, BackendKind::Scalar);
        assert!(conditioned.fallback.as_deref().unwrap().contains("device lost"));
        assert_eq!(conditioned.value, condition_scalar(samples.view()));

        let spec = FilterSpec::design(500, 50.0, 30.0).unwrap();
        let filtered = dispatcher.filter(conditioned.value.view(), &spec).unwrap();
        assert!(filtered.fallback.is_some());
        assert_eq!(
            filtered.value,
            filter_scalar(conditioned.value.view(), &spec).unwrap()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn worker_panic_becomes_backend_error() {
        let backend = ParallelBackend::new(pool(2));
        let result: Result<(), BackendError> = backend.run(|| panic!("kernel fault"));
        assert_eq!(
            result,
            Err(BackendError::Accelerator("kernel fault".to_string()))
        );
    }
}
