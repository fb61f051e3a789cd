use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

use crate::config::TelemetryConfig;

pub fn init_provider(telemetry: &TelemetryConfig, instance_id: &str) -> Result<()> {
    // Early exit if metrics are disabled
    if !telemetry.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "invocation-host"))
        .with_attribute(KeyValue::new("service.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION").to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(telemetry.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub mod scheduler_metrics {
    use opentelemetry::{global, metrics::Counter};

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub invocations: Counter<u64>,
        pub warm_starts: Counter<u64>,
        pub cold_starts: Counter<u64>,
        pub results: Counter<u64>,
        pub worker_exits: Counter<u64>,
        pub drains: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Self {
            let meter = global::meter("invocation-host");

            let invocations = meter
                .u64_counter("invocation_host.invocations")
                .with_description("Invocations submitted to the scheduler")
                .build();

            let warm_starts = meter
                .u64_counter("invocation_host.warm_starts")
                .with_description("Invocations handed directly to an idle worker")
                .build();

            let cold_starts = meter
                .u64_counter("invocation_host.cold_starts")
                .with_description("Worker processes launched for queued invocations")
                .build();

            let results = meter
                .u64_counter("invocation_host.results")
                .with_description("Results delivered to a waiting caller, by outcome")
                .build();

            let worker_exits = meter
                .u64_counter("invocation_host.worker_exits")
                .with_description("Worker processes that exited")
                .build();

            let drains = meter
                .u64_counter("invocation_host.drains")
                .with_description("Pool drains")
                .build();

            Self {
                invocations,
                warm_starts,
                cold_starts,
                results,
                worker_exits,
                drains,
            }
        }
    }
}
