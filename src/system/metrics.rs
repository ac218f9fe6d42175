//! Metrics collection for the synchronization core
//!
//! Metrics are registered into a registry the caller owns; there is no
//! process-wide instance. Everything outside the dispatcher only reads them.

use crate::core::config::MetricsConfig;
use crate::core::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Outbound flush metrics
#[derive(Clone)]
pub struct FlushMetrics {
    /// Messages handed to the transport
    pub messages_sent: IntCounter,
    /// Flushes that found nothing to send
    pub empty_flushes: IntCounter,
    /// Remote calls written into messages
    pub calls_sent: IntCounter,
    /// Extra serialization rounds caused by changes made while serializing
    pub extra_rounds: IntCounter,
    /// Flushes that hit the extra round cap
    pub cycle_overflows: IntCounter,
    /// Changes dropped because of the round cap
    pub dropped_changes: IntCounter,
    /// Flushes whose message was handed back to the window after an error
    pub failed_flushes: IntCounter,
    /// Duration of a flush in seconds
    pub flush_duration: Histogram,
}

/// Client input metrics
#[derive(Clone)]
pub struct ClientMetrics {
    /// Client writes and events refused by a gate
    pub rejected_changes: IntCounter,
    /// Versioned client updates computed against an old collection version
    pub stale_updates: IntCounter,
}

/// Event dispatcher metrics
#[derive(Clone)]
pub struct DispatcherMetrics {
    /// Tasks run
    pub tasks_dispatched: IntCounter,
    /// Tasks that returned an error
    pub task_failures: IntCounter,
    /// Tasks waiting in the queue
    pub queue_depth: IntGauge,
}

/// All metrics of one synchronization core instance
#[derive(Clone)]
pub struct SyncMetrics {
    pub flush: FlushMetrics,
    pub client: ClientMetrics,
    pub dispatcher: DispatcherMetrics,
}

/// Point-in-time copy of the metric values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub empty_flushes: u64,
    pub calls_sent: u64,
    pub extra_rounds: u64,
    pub cycle_overflows: u64,
    pub dropped_changes: u64,
    pub failed_flushes: u64,
    pub timed_flushes: u64,
    pub rejected_changes: u64,
    pub stale_updates: u64,
    pub tasks_dispatched: u64,
    pub task_failures: u64,
    pub queue_depth: i64,
}

fn counter(registry: &Registry, namespace: &str, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, namespace: &str, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl FlushMetrics {
    fn register(registry: &Registry, namespace: &str) -> Result<Self> {
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Duration of outbound flushes in seconds")
                .namespace(namespace)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            messages_sent: counter(
                registry,
                namespace,
                "messages_sent_total",
                "Total messages handed to the transport",
            )?,
            empty_flushes: counter(
                registry,
                namespace,
                "empty_flushes_total",
                "Total flushes with nothing to send",
            )?,
            calls_sent: counter(
                registry,
                namespace,
                "calls_sent_total",
                "Total remote calls sent",
            )?,
            extra_rounds: counter(
                registry,
                namespace,
                "extra_serialization_rounds_total",
                "Total extra serialization rounds",
            )?,
            cycle_overflows: counter(
                registry,
                namespace,
                "serialization_cycle_overflows_total",
                "Total flushes that exceeded the extra round cap",
            )?,
            dropped_changes: counter(
                registry,
                namespace,
                "dropped_changes_total",
                "Total changes dropped at the extra round cap",
            )?,
            failed_flushes: counter(
                registry,
                namespace,
                "failed_flushes_total",
                "Total flushes that failed and kept their message for the next flush",
            )?,
            flush_duration,
        })
    }
}

impl ClientMetrics {
    fn register(registry: &Registry, namespace: &str) -> Result<Self> {
        Ok(Self {
            rejected_changes: counter(
                registry,
                namespace,
                "rejected_client_changes_total",
                "Total client changes and events refused by a gate",
            )?,
            stale_updates: counter(
                registry,
                namespace,
                "stale_client_updates_total",
                "Total client collection updates with an old version",
            )?,
        })
    }
}

impl DispatcherMetrics {
    fn register(registry: &Registry, namespace: &str) -> Result<Self> {
        Ok(Self {
            tasks_dispatched: counter(
                registry,
                namespace,
                "tasks_dispatched_total",
                "Total dispatcher tasks run",
            )?,
            task_failures: counter(
                registry,
                namespace,
                "task_failures_total",
                "Total dispatcher tasks that failed",
            )?,
            queue_depth: gauge(
                registry,
                namespace,
                "dispatcher_queue_depth",
                "Tasks waiting in the dispatcher queue",
            )?,
        })
    }
}

impl SyncMetrics {
    /// Register all metrics under `namespace`
    pub fn register(registry: &Registry, namespace: &str) -> Result<Self> {
        Ok(Self {
            flush: FlushMetrics::register(registry, namespace)?,
            client: ClientMetrics::register(registry, namespace)?,
            dispatcher: DispatcherMetrics::register(registry, namespace)?,
        })
    }

    /// Register under the configured namespace, or nothing when disabled
    pub fn from_config(config: &MetricsConfig, registry: &Registry) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::register(registry, &config.namespace).map(Some)
    }

    /// Read every value
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.flush.messages_sent.get(),
            empty_flushes: self.flush.empty_flushes.get(),
            calls_sent: self.flush.calls_sent.get(),
            extra_rounds: self.flush.extra_rounds.get(),
            cycle_overflows: self.flush.cycle_overflows.get(),
            dropped_changes: self.flush.dropped_changes.get(),
            failed_flushes: self.flush.failed_flushes.get(),
            timed_flushes: self.flush.flush_duration.get_sample_count(),
            rejected_changes: self.client.rejected_changes.get(),
            stale_updates: self.client.stale_updates.get(),
            tasks_dispatched: self.dispatcher.tasks_dispatched.get(),
            task_failures: self.dispatcher.task_failures.get(),
            queue_depth: self.dispatcher.queue_depth.get(),
        }
    }
}

/// Timer recording into a histogram when finished
pub struct Timer {
    start: Instant,
    histogram: Histogram,
}

impl Timer {
    /// Start a new timer
    pub fn start(histogram: Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Render a registry in the prometheus text format
pub fn encode_text(registry: &Registry) -> Result<String> {
    let encoder = prometheus::TextEncoder::new();
    Ok(encoder.encode_to_string(&registry.gather())?)
}
