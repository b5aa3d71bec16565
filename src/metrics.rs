//! Optional observability hooks.
//!
//! With the `metrics` feature, migration outcomes and lock contention are
//! recorded through OpenTelemetry instruments on a process-wide [`METRICS`]
//! instance. With the `tracing` feature, [`tracing_helpers`] provides the spans
//! used around connection, lock, transaction and subprocess work.

#[cfg(feature = "metrics")]
pub use otel::{install_prometheus_exporter, MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, Meter},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    pub struct MigrationMetrics {
        pub migrations_applied: Counter<u64>,
        pub migrations_failed: Counter<u64>,
        pub lock_contention: Counter<u64>,
        pub lock_wait: Histogram<f64>,
        pub migration_duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        pub fn init() -> Self {
            Self::new(&global::meter("lockstep"))
        }

        pub fn new(meter: &Meter) -> Self {
            let migrations_applied = meter
                .u64_counter("lockstep_migrations_applied_total")
                .with_description("Migrations applied successfully")
                .build();

            let migrations_failed = meter
                .u64_counter("lockstep_migrations_failed_total")
                .with_description("Migrations that failed during execution")
                .build();

            let lock_contention = meter
                .u64_counter("lockstep_lock_contention_total")
                .with_description("Migration lock acquisitions refused because another session held it")
                .build();

            let lock_wait = meter
                .f64_histogram("lockstep_lock_wait_seconds")
                .with_description("Time spent acquiring the migration lock")
                .build();

            let migration_duration = meter
                .f64_histogram("lockstep_migration_duration_seconds")
                .with_description("Duration of individual migrations")
                .build();

            Self {
                migrations_applied,
                migrations_failed,
                lock_contention,
                lock_wait,
                migration_duration,
            }
        }

        pub fn record_applied(&self, executor: &'static str, elapsed: Duration) {
            self.migrations_applied
                .add(1, &[KeyValue::new("executor", executor)]);
            self.migration_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_failed(&self, executor: &'static str) {
            self.migrations_failed
                .add(1, &[KeyValue::new("executor", executor)]);
        }

        pub fn record_lock_contention(&self) {
            self.lock_contention.add(1, &[]);
        }

        pub fn record_lock_wait(&self, elapsed: Duration, acquired: bool) {
            self.lock_wait
                .record(elapsed.as_secs_f64(), &[KeyValue::new("acquired", acquired)]);
        }
    }

    /// Route the global meter provider into a Prometheus registry
    ///
    /// # Errors
    ///
    /// Returns the exporter's error message if it cannot be built.
    pub fn install_prometheus_exporter() -> Result<prometheus::Registry, String> {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| format!("failed to build prometheus exporter: {e}"))?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider);
        Ok(registry)
    }
}


#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn connect_span() -> Span {
        info_span!("lockstep.connect")
    }

    pub fn acquire_lock_span(lock_name: &str, lock_id: i64) -> Span {
        info_span!("lockstep.lock.acquire", lock_name, lock_id)
    }

    pub fn apply_migration_span(name: &str) -> Span {
        info_span!("lockstep.migration.apply", migration = name)
    }

    pub fn execute_script_span() -> Span {
        info_span!("lockstep.script.execute")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("lockstep.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("lockstep.transaction.commit")
    }

    pub fn subprocess_span(program: &str) -> Span {
        info_span!("lockstep.subprocess", program)
    }
}
