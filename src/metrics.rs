//! Migration metrics and tracing spans
//!
//! With the `metrics` feature, [`METRICS`] records per-migration counts and
//! durations plus advisory lock wait times through OpenTelemetry, exported
//! into a Prometheus registry. With the `tracing` feature,
//! [`tracing_helpers`] supplies the spans sessions and steps run in.

#[cfg(feature = "metrics")]
pub use self::otel::{MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use crate::migration::Direction;
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, Meter, MeterProvider as _},
        KeyValue,
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    /// Migration counters and histograms, plus the registry they export to
    pub struct MigrationMetrics {
        /// Registry the Prometheus exporter writes into
        pub registry: Registry,
        /// Kept alive so the exporter keeps collecting
        _provider: Option<SdkMeterProvider>,
        pub migrations_total: Counter<u64>,
        pub migration_failures_total: Counter<u64>,
        pub migration_duration: Histogram<f64>,
        pub lock_wait_duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        /// Builds the instruments, falling back to the global meter if the exporter fails
        pub fn init() -> Self {
            let registry = Registry::new();
            let (provider, meter) = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => {
                    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                    let meter = provider.meter("lockstep");
                    (Some(provider), meter)
                }
                Err(e) => {
                    log::warn!(
                        "migrate: prometheus exporter unavailable, using global meter: {e}"
                    );
                    (None, global::meter("lockstep"))
                }
            };
            Self::with_meter(registry, provider, &meter)
        }

        fn with_meter(
            registry: Registry,
            provider: Option<SdkMeterProvider>,
            meter: &Meter,
        ) -> Self {
            let migrations_total = meter
                .u64_counter("lockstep_migrations_total")
                .with_description("Migrations applied or reverted")
                .build();

            let migration_failures_total = meter
                .u64_counter("lockstep_migration_failures_total")
                .with_description("Migrations that failed and were rolled back")
                .build();

            let migration_duration = meter
                .f64_histogram("lockstep_migration_duration_seconds")
                .with_description("Duration of one migration's transaction")
                .build();

            let lock_wait_duration = meter
                .f64_histogram("lockstep_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock")
                .build();

            Self {
                registry,
                _provider: provider,
                migrations_total,
                migration_failures_total,
                migration_duration,
                lock_wait_duration,
            }
        }

        /// Counts one finished migration and records how long it took
        pub fn record_migration(&self, direction: Direction, elapsed: Duration, succeeded: bool) {
            let labels = [KeyValue::new("direction", direction.as_str())];
            if succeeded {
                self.migrations_total.add(1, &labels);
            } else {
                self.migration_failures_total.add(1, &labels);
            }
            self.migration_duration.record(elapsed.as_secs_f64(), &labels);
        }

        /// Records how long a session waited for the advisory lock
        pub fn record_lock_wait(&self, waited: Duration) {
            self.lock_wait_duration.record(waited.as_secs_f64(), &[]);
        }

        /// Current values in the Prometheus text format
        ///
        /// # Errors
        ///
        /// Returns `prometheus::Error` if encoding fails.
        pub fn gather(&self) -> Result<String, prometheus::Error> {
            TextEncoder::new().encode_to_string(&self.registry.gather())
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    /// Span around one whole session
    pub fn session_span(table: &str) -> Span {
        info_span!("lockstep.session", table = table)
    }

    /// Span around one migration's transaction
    pub fn migration_span(version: i64, name: &str, direction: &str) -> Span {
        info_span!("lockstep.migration", version, name, direction)
    }

    /// Span around one script execution
    pub fn execute_script_span(script: &str) -> Span {
        info_span!("lockstep.execute_script", bytes = script.len())
    }

    /// Span around opening a connection
    pub fn connect_span() -> Span {
        info_span!("lockstep.connect")
    }

    /// Span around `BEGIN`
    pub fn begin_transaction_span() -> Span {
        info_span!("lockstep.transaction.begin")
    }

    /// Span around `COMMIT`
    pub fn commit_transaction_span() -> Span {
        info_span!("lockstep.transaction.commit")
    }

    /// Span around `ROLLBACK`
    pub fn rollback_transaction_span() -> Span {
        info_span!("lockstep.transaction.rollback")
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use crate::migration::Direction;
    use std::time::Duration;

    #[test]
    fn test_recording_does_not_panic_and_gathers() {
        METRICS.record_migration(Direction::Up, Duration::from_millis(3), true);
        METRICS.record_migration(Direction::Down, Duration::from_millis(1), false);
        METRICS.record_lock_wait(Duration::from_millis(2));
        assert!(METRICS.gather().is_ok());
    }
}
