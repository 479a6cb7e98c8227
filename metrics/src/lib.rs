use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

/// Installs the global OTLP meter provider. Meters created before this call
/// record into the no-op provider.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "trainjob-controller"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "trainjob.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between creation and drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub mod controller_metrics {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub syncs: Counter<u64>,
        pub sync_errors: Counter<u64>,
        pub sync_duration: Histogram<f64>,
        pub processes_created: Counter<u64>,
        pub processes_deleted: Counter<u64>,
        pub endpoints_created: Counter<u64>,
        pub status_updates: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("trainjob-controller");
            let syncs = meter
                .u64_counter("trainjob.syncs")
                .with_description("number of job reconciliations")
                .build();
            let sync_errors = meter
                .u64_counter("trainjob.sync_errors")
                .with_description("number of job reconciliations that returned an error")
                .build();
            let sync_duration = meter
                .f64_histogram("trainjob.sync_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("job reconciliation latency in seconds")
                .build();
            let processes_created = meter
                .u64_counter("trainjob.processes_created")
                .with_description("number of worker processes created")
                .build();
            let processes_deleted = meter
                .u64_counter("trainjob.processes_deleted")
                .with_description("number of terminated worker processes deleted")
                .build();
            let endpoints_created = meter
                .u64_counter("trainjob.endpoints_created")
                .with_description("number of replica endpoints created")
                .build();
            let status_updates = meter
                .u64_counter("trainjob.status_updates")
                .with_description("number of job status writes")
                .build();
            Metrics {
                syncs,
                sync_errors,
                sync_duration,
                processes_created,
                processes_deleted,
                endpoints_created,
                status_updates,
            }
        }
    }
}

pub mod queue_metrics {
    use opentelemetry::metrics::{Counter, UpDownCounter};

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub adds: Counter<u64>,
        pub retries: Counter<u64>,
        pub depth: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("trainjob-work-queue");
            let adds = meter
                .u64_counter("trainjob.queue_adds")
                .with_description("number of keys submitted to the work queue")
                .build();
            let retries = meter
                .u64_counter("trainjob.queue_retries")
                .with_description("number of rate limited re-enqueues")
                .build();
            let depth = meter
                .i64_up_down_counter("trainjob.queue_depth")
                .with_description("number of keys waiting to be processed")
                .build();
            Metrics {
                adds,
                retries,
                depth,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordedDurations {
        records: Mutex<Vec<(Duration, Vec<KeyValue>)>>,
    }

    impl TimerUpdate for RecordedDurations {
        fn add(&self, duration: Duration, labels: &[KeyValue]) {
            self.records
                .lock()
                .unwrap()
                .push((duration, labels.to_vec()));
        }
    }

    #[test]
    fn test_timer_records_on_drop() {
        let recorded = RecordedDurations::default();
        let labels = [KeyValue::new("result", "ok")];
        {
            let _timer = Timer::start_with_labels(&recorded, &labels);
            std::thread::sleep(Duration::from_millis(5));
            assert!(recorded.records.lock().unwrap().is_empty());
        }
        let records = recorded.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].0 >= Duration::from_millis(5));
        assert_eq!(records[0].1, labels.to_vec());
    }

    #[test]
    fn test_disabled_provider() {
        let provider = init_provider(false, None, Duration::from_secs(10), "test", "0.1.0").unwrap();
        assert!(provider.is_none());
    }
}
