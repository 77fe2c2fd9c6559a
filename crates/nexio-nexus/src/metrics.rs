//! Metrics collection and Prometheus exporter for nexuses
//!
//! ## Nexus Metrics
//! - `nexio_nexus_status` - Nexus status (0=faulted, 1=degraded, 2=online, -1=shut down)
//! - `nexio_nexus_size_bytes` - Nexus size
//! - `nexio_nexus_children` - Children per nexus, by health
//! - `nexio_nexus_read_ops_total` / `nexio_nexus_write_ops_total` - Application I/O
//! - `nexio_nexus_read_bytes_total` / `nexio_nexus_write_bytes_total`
//! - `nexio_nexus_io_errors_total` - Failed application I/O
//! - `nexio_nexus_read_latency_seconds` / `nexio_nexus_write_latency_seconds`
//! - `nexio_nexus_rebuilds_active` - Rebuild jobs in flight
//!
//! ## Child Metrics
//! - `nexio_child_online` - 1 when the child may serve reads
//! - `nexio_child_in_flight` - Outstanding commands
//! - `nexio_child_read_ops_total` / `nexio_child_write_ops_total`
//! - `nexio_child_errors_total`
//! - `nexio_child_rebuild_progress_percent` - Progress of the rebuild targeting the child

use std::collections::HashMap;
use std::fmt::Write;

use nexio_device::{IoStatsSnapshot, LatencySummary};
use parking_lot::RwLock;

use crate::child::ChildStatus;
use crate::nexus::{Nexus, NexusStatus};

impl NexusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NexusStatus::Online => "online",
            NexusStatus::Degraded => "degraded",
            NexusStatus::Faulted => "faulted",
            NexusStatus::ShuttingDown => "shutting_down",
            NexusStatus::Shutdown => "shutdown",
        }
    }

    /// Gauge value for Prometheus
    pub fn as_value(&self) -> f64 {
        match self {
            NexusStatus::Online => 2.0,
            NexusStatus::Degraded => 1.0,
            NexusStatus::Faulted => 0.0,
            NexusStatus::ShuttingDown | NexusStatus::Shutdown => -1.0,
        }
    }
}

/// Nexus metrics snapshot
#[derive(Debug, Clone)]
pub struct NexusMetrics {
    pub name: String,
    pub status: NexusStatus,
    pub size_bytes: u64,
    pub children_total: usize,
    pub children_healthy: usize,
    pub children_faulted: usize,
    pub rebuilds_active: usize,
    pub io: IoStatsSnapshot,
}

/// Child metrics snapshot
#[derive(Debug, Clone)]
pub struct ChildMetrics {
    pub nexus: String,
    pub uri: String,
    pub status: ChildStatus,
    pub in_flight: usize,
    pub io: IoStatsSnapshot,
    pub rebuild_progress: Option<u8>,
}

/// Metrics collector fed from live nexuses
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Nexus metrics indexed by name
    nexuses: RwLock<HashMap<String, NexusMetrics>>,
    /// Child metrics indexed by nexus name
    children: RwLock<HashMap<String, Vec<ChildMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample a nexus and its children
    pub fn update_nexus(&self, nexus: &Nexus) {
        let children = nexus.children();
        let metrics = NexusMetrics {
            name: nexus.name().to_string(),
            status: nexus.status(),
            size_bytes: nexus.size_bytes(),
            children_total: children.len(),
            children_healthy: children
                .iter()
                .filter(|c| c.status == ChildStatus::Online)
                .count(),
            children_faulted: children
                .iter()
                .filter(|c| matches!(c.status, ChildStatus::Faulted | ChildStatus::Faulting))
                .count(),
            rebuilds_active: nexus.active_rebuilds(),
            io: nexus.stats().nexus,
        };
        let child_metrics = children
            .into_iter()
            .map(|c| ChildMetrics {
                nexus: nexus.name().to_string(),
                uri: c.uri,
                status: c.status,
                in_flight: c.in_flight,
                io: c.stats.unwrap_or_default(),
                rebuild_progress: c.rebuild_progress,
            })
            .collect();

        self.nexuses
            .write()
            .insert(metrics.name.clone(), metrics);
        self.children
            .write()
            .insert(nexus.name().to_string(), child_metrics);
    }

    /// Remove a nexus and its children
    pub fn remove_nexus(&self, name: &str) {
        self.nexuses.write().remove(name);
        self.children.write().remove(name);
    }

    /// Get all nexus metrics, sorted by name
    pub fn get_nexuses(&self) -> Vec<NexusMetrics> {
        let mut nexuses: Vec<_> = self.nexuses.read().values().cloned().collect();
        nexuses.sort_by(|a, b| a.name.cmp(&b.name));
        nexuses
    }

    /// Get all child metrics, grouped by nexus
    pub fn get_children(&self) -> Vec<ChildMetrics> {
        let children = self.children.read();
        let mut names: Vec<_> = children.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| children[name].iter().cloned())
            .collect()
    }

    pub fn get_nexus(&self, name: &str) -> Option<NexusMetrics> {
        self.nexuses.read().get(name).cloned()
    }
}

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "nexio")
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self, collector: &MetricsCollector) -> String {
        let mut output = String::with_capacity(8 * 1024);

        self.export_nexus_metrics(&mut output, collector);
        self.export_child_metrics(&mut output, collector);

        output
    }

    fn export_nexus_metrics(&self, output: &mut String, collector: &MetricsCollector) {
        let nexuses = collector.get_nexuses();
        if nexuses.is_empty() {
            return;
        }

        self.write_help(
            output,
            "nexus_status",
            "Nexus status (0=faulted, 1=degraded, 2=online, -1=shut down)",
        );
        self.write_type(output, "nexus_status", "gauge");
        for nexus in &nexuses {
            self.write_metric_with_labels(
                output,
                "nexus_status",
                nexus.status.as_value(),
                &[("nexus", &nexus.name), ("status", nexus.status.as_str())],
            );
        }

        self.write_help(output, "nexus_size_bytes", "Nexus size in bytes");
        self.write_type(output, "nexus_size_bytes", "gauge");
        for nexus in &nexuses {
            self.write_metric_with_labels(
                output,
                "nexus_size_bytes",
                nexus.size_bytes as f64,
                &[("nexus", &nexus.name)],
            );
        }

        self.write_help(output, "nexus_children", "Children per nexus by health");
        self.write_type(output, "nexus_children", "gauge");
        for nexus in &nexuses {
            for (health, count) in [
                ("total", nexus.children_total),
                ("healthy", nexus.children_healthy),
                ("faulted", nexus.children_faulted),
            ] {
                self.write_metric_with_labels(
                    output,
                    "nexus_children",
                    count as f64,
                    &[("nexus", &nexus.name), ("health", health)],
                );
            }
        }

        let counters: [(&str, &str, fn(&IoStatsSnapshot) -> u64); 5] = [
            ("nexus_read_ops_total", "Total read operations", |s| s.read_ops),
            ("nexus_write_ops_total", "Total write operations", |s| {
                s.write_ops
            }),
            ("nexus_read_bytes_total", "Total bytes read", |s| s.bytes_read),
            ("nexus_write_bytes_total", "Total bytes written", |s| {
                s.bytes_written
            }),
            ("nexus_io_errors_total", "Failed application I/O", |s| {
                s.errors
            }),
        ];
        for (name, help, value) in counters {
            self.write_help(output, name, help);
            self.write_type(output, name, "counter");
            for nexus in &nexuses {
                self.write_metric_with_labels(
                    output,
                    name,
                    value(&nexus.io) as f64,
                    &[("nexus", &nexus.name)],
                );
            }
        }

        self.write_help(
            output,
            "nexus_read_latency_seconds",
            "Read latency quantiles",
        );
        self.write_type(output, "nexus_read_latency_seconds", "summary");
        for nexus in &nexuses {
            self.export_latency_summary(
                output,
                "nexus_read_latency_seconds",
                &nexus.name,
                &nexus.io.read_latency,
            );
        }

        self.write_help(
            output,
            "nexus_write_latency_seconds",
            "Write latency quantiles",
        );
        self.write_type(output, "nexus_write_latency_seconds", "summary");
        for nexus in &nexuses {
            self.export_latency_summary(
                output,
                "nexus_write_latency_seconds",
                &nexus.name,
                &nexus.io.write_latency,
            );
        }

        self.write_help(output, "nexus_rebuilds_active", "Rebuild jobs in flight");
        self.write_type(output, "nexus_rebuilds_active", "gauge");
        for nexus in &nexuses {
            self.write_metric_with_labels(
                output,
                "nexus_rebuilds_active",
                nexus.rebuilds_active as f64,
                &[("nexus", &nexus.name)],
            );
        }
    }

    fn export_child_metrics(&self, output: &mut String, collector: &MetricsCollector) {
        let children = collector.get_children();
        if children.is_empty() {
            return;
        }

        self.write_help(output, "child_online", "1 when the child may serve reads");
        self.write_type(output, "child_online", "gauge");
        for child in &children {
            let online = if child.status == ChildStatus::Online {
                1.0
            } else {
                0.0
            };
            self.write_metric_with_labels(
                output,
                "child_online",
                online,
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }

        self.write_help(output, "child_in_flight", "Outstanding commands");
        self.write_type(output, "child_in_flight", "gauge");
        for child in &children {
            self.write_metric_with_labels(
                output,
                "child_in_flight",
                child.in_flight as f64,
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }

        self.write_help(output, "child_read_ops_total", "Reads served by the child");
        self.write_type(output, "child_read_ops_total", "counter");
        for child in &children {
            self.write_metric_with_labels(
                output,
                "child_read_ops_total",
                child.io.read_ops as f64,
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }

        self.write_help(output, "child_write_ops_total", "Writes applied to the child");
        self.write_type(output, "child_write_ops_total", "counter");
        for child in &children {
            self.write_metric_with_labels(
                output,
                "child_write_ops_total",
                child.io.write_ops as f64,
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }

        self.write_help(output, "child_errors_total", "Commands failed by the child");
        self.write_type(output, "child_errors_total", "counter");
        for child in &children {
            self.write_metric_with_labels(
                output,
                "child_errors_total",
                child.io.errors as f64,
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }

        let rebuilding: Vec<_> = children
            .iter()
            .filter_map(|c| c.rebuild_progress.map(|p| (c, p)))
            .collect();
        if rebuilding.is_empty() {
            return;
        }
        self.write_help(
            output,
            "child_rebuild_progress_percent",
            "Progress of the rebuild targeting the child",
        );
        self.write_type(output, "child_rebuild_progress_percent", "gauge");
        for (child, progress) in rebuilding {
            self.write_metric_with_labels(
                output,
                "child_rebuild_progress_percent",
                f64::from(progress),
                &[("nexus", &child.nexus), ("child", &child.uri)],
            );
        }
    }

    fn export_latency_summary(
        &self,
        output: &mut String,
        name: &str,
        nexus: &str,
        latency: &LatencySummary,
    ) {
        for (quantile, value) in [("0.5", latency.p50_us), ("0.99", latency.p99_us)] {
            let _ = writeln!(
                output,
                "{}_{}{{nexus=\"{nexus}\",quantile=\"{quantile}\"}} {}",
                self.prefix,
                name,
                value as f64 / 1_000_000.0
            );
        }
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("nexio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexio_common::NexusConfig;
    use nexio_device::UriDeviceFactory;
    use std::sync::Arc;

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new();
        collector.nexuses.write().insert(
            "nexus0".to_string(),
            NexusMetrics {
                name: "nexus0".to_string(),
                status: NexusStatus::Degraded,
                size_bytes: 64 * 1024 * 1024,
                children_total: 2,
                children_healthy: 1,
                children_faulted: 1,
                rebuilds_active: 0,
                io: IoStatsSnapshot {
                    read_ops: 1000,
                    write_ops: 500,
                    ..Default::default()
                },
            },
        );

        let exporter = PrometheusExporter::default();
        let output = exporter.export(&collector);

        assert!(output.contains("# TYPE nexio_nexus_status gauge"));
        assert!(output.contains("nexio_nexus_status{nexus=\"nexus0\",status=\"degraded\"} 1"));
        assert!(output.contains("nexio_nexus_size_bytes{nexus=\"nexus0\"} 67108864"));
        assert!(output.contains("nexio_nexus_read_ops_total{nexus=\"nexus0\"} 1000"));
        assert!(output.contains("health=\"faulted\"} 1"));
        // No children sampled
        assert!(!output.contains("nexio_child_online"));
    }

    #[tokio::test]
    async fn test_collect_from_nexus() {
        let factory = Arc::new(UriDeviceFactory::new());
        let children = vec![
            "malloc:///m0?size_mb=1".to_string(),
            "malloc:///m1?size_mb=1".to_string(),
        ];
        let config = NexusConfig {
            io_channels: 1,
            reconnect_interval_ms: 0,
            ..NexusConfig::default()
        };
        let nexus = Nexus::create("nexus0", 1024 * 1024, &children, config, factory)
            .await
            .unwrap();
        nexus.write(0, bytes::Bytes::from(vec![1u8; 4096])).await.unwrap();

        let collector = MetricsCollector::new();
        collector.update_nexus(&nexus);
        let metrics = collector.get_nexus("nexus0").unwrap();
        assert_eq!(metrics.status, NexusStatus::Online);
        assert_eq!(metrics.children_healthy, 2);
        assert_eq!(metrics.io.write_ops, 1);

        let output = PrometheusExporter::default().export(&collector);
        assert!(output.contains(
            "nexio_child_write_ops_total{nexus=\"nexus0\",child=\"malloc:///m0?size_mb=1\"} 1"
        ));

        collector.remove_nexus("nexus0");
        assert!(collector.get_children().is_empty());
    }
}
