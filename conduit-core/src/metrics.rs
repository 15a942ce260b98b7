//! Idempotent metric registration
//!
//! Every instance registers the same metric names when it starts. The
//! registry hands back the already-registered metric for a repeated name of
//! the same kind, so module initialization can run any number of times.
//! Registering a name under a different kind is a programming error and
//! panics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Gauge whose value is computed on demand.
///
/// The function is evaluated whenever the registry is gathered.
#[derive(Clone)]
pub struct GaugeFn {
    gauge: Gauge,
    function: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl GaugeFn {
    /// Re-evaluates the function and stores the result.
    pub fn refresh(&self) {
        self.gauge.set((self.function)());
    }

    /// Value stored by the last refresh.
    pub fn get(&self) -> f64 {
        self.gauge.get()
    }
}

impl fmt::Debug for GaugeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeFn")
            .field("value", &self.gauge.get())
            .finish()
    }
}

#[derive(Clone)]
enum RegisteredMetric {
    Gauge(Gauge),
    GaugeVec { vec: GaugeVec, labels: Vec<String> },
    GaugeFn(GaugeFn),
}

impl RegisteredMetric {
    fn kind(&self) -> &'static str {
        match self {
            RegisteredMetric::Gauge(_) => "gauge",
            RegisteredMetric::GaugeVec { .. } => "gauge vector",
            RegisteredMetric::GaugeFn(_) => "gauge function",
        }
    }
}

/// Process-scoped metric registry with lookup-or-insert semantics.
///
/// Shared through `Arc` by the initialization path that owns it; there is
/// no global instance.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: Mutex<HashMap<String, RegisteredMetric>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the gauge named `name`, registering it on first use.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered as a different metric kind, or
    /// if the name is not a valid metric name.
    pub fn gauge(&self, name: &str, help: &str) -> Gauge {
        let registered = self.lookup_or_insert(name, || {
            let gauge = Gauge::with_opts(Opts::new(name, help))
                .unwrap_or_else(|e| panic!("invalid gauge {name}: {e}"));
            RegisteredMetric::Gauge(gauge)
        });

        match registered {
            RegisteredMetric::Gauge(gauge) => gauge,
            other => mismatch(name, "gauge", &other),
        }
    }

    /// Returns the gauge vector named `name`, registering it on first use.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered as a different metric kind or
    /// with different label names.
    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
        let registered = self.lookup_or_insert(name, || {
            let vec = GaugeVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|e| panic!("invalid gauge vector {name}: {e}"));
            RegisteredMetric::GaugeVec {
                vec,
                labels: labels.iter().map(|label| label.to_string()).collect(),
            }
        });

        match registered {
            RegisteredMetric::GaugeVec {
                vec,
                labels: registered_labels,
            } => {
                if registered_labels != labels {
                    panic!(
                        "gauge vector {name} registered with labels {registered_labels:?}, requested {labels:?}"
                    );
                }
                vec
            }
            other => mismatch(name, "gauge vector", &other),
        }
    }

    /// Returns the gauge function named `name`, registering it on first use.
    ///
    /// A repeated registration keeps the original function.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered as a different metric kind.
    pub fn gauge_fn<F>(&self, name: &str, help: &str, function: F) -> GaugeFn
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let registered = self.lookup_or_insert(name, || {
            let gauge = Gauge::with_opts(Opts::new(name, help))
                .unwrap_or_else(|e| panic!("invalid gauge function {name}: {e}"));
            let gauge_fn = GaugeFn {
                gauge,
                function: Arc::new(function),
            };
            gauge_fn.refresh();
            RegisteredMetric::GaugeFn(gauge_fn)
        });

        match registered {
            RegisteredMetric::GaugeFn(gauge_fn) => gauge_fn,
            other => mismatch(name, "gauge function", &other),
        }
    }

    /// Number of distinct registered metric names.
    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders all metrics in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// - `prometheus::Error` - If encoding fails
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let functions: Vec<GaugeFn> = self
            .metrics
            .lock()
            .values()
            .filter_map(|metric| match metric {
                RegisteredMetric::GaugeFn(gauge_fn) => Some(gauge_fn.clone()),
                _ => None,
            })
            .collect();
        // Evaluated outside the lock
        for gauge_fn in &functions {
            gauge_fn.refresh();
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn lookup_or_insert(
        &self,
        name: &str,
        create: impl FnOnce() -> RegisteredMetric,
    ) -> RegisteredMetric {
        let mut metrics = self.metrics.lock();
        if let Some(existing) = metrics.get(name) {
            return existing.clone();
        }

        let metric = create();
        let collector: Box<dyn prometheus::core::Collector> = match &metric {
            RegisteredMetric::Gauge(gauge) => Box::new(gauge.clone()),
            RegisteredMetric::GaugeVec { vec, .. } => Box::new(vec.clone()),
            RegisteredMetric::GaugeFn(gauge_fn) => Box::new(gauge_fn.gauge.clone()),
        };
        if let Err(e) = self.registry.register(collector) {
            panic!("failed to register metric {name}: {e}");
        }

        metrics.insert(name.to_string(), metric.clone());
        metric
    }
}

fn mismatch(name: &str, requested: &str, registered: &RegisteredMetric) -> ! {
    panic!(
        "different metric type registration: {name} is a {}, requested {requested}",
        registered.kind()
    )
}
