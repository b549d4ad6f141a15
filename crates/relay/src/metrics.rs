use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    fanout_deliveries_total: AtomicU64,
    fanout_dropped_total: AtomicU64,
    connections_opened_total: AtomicU64,
    connections_closed_total: AtomicU64,
    active_connections: AtomicI64,
    online_users: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_event(kind: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(kind, is_error, latency_ms);
    }
}

pub fn record_fanout(delivered: usize, dropped: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_fanout(delivered, dropped);
    }
}

pub fn record_connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_opened();
    }
}

pub fn record_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.record_connection_closed();
    }
}

pub fn set_online_users(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_online_users(count);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_event(&self, kind: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_event_kind(kind);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_fanout(&self, delivered: usize, dropped: usize) {
        self.fanout_deliveries_total.fetch_add(delivered as u64, Ordering::Relaxed);
        self.fanout_dropped_total.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_online_users(&self, count: usize) {
        self.online_users.store(i64::try_from(count).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_events_total Total inbound websocket events by kind.\n");
        output.push_str("# TYPE relay_ws_events_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_events_total", &self.ws_rate_total);

        output.push_str(
            "# HELP relay_ws_event_errors_total Inbound websocket events answered with an error.\n",
        );
        output.push_str("# TYPE relay_ws_event_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_event_errors_total", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_event_duration_ms_sum Sum of websocket event handling latency in milliseconds by kind.\n");
        output.push_str("# TYPE relay_ws_event_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_event_duration_ms_sum",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_event_duration_ms_count Count of websocket event latency samples by kind.\n",
        );
        output.push_str("# TYPE relay_ws_event_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_event_duration_ms_count",
            &self.ws_duration_count,
        );

        push_scalar(
            &mut output,
            "relay_fanout_deliveries_total",
            "counter",
            "Events queued to recipient connections.",
            self.fanout_deliveries_total.load(Ordering::Relaxed),
        );
        push_scalar(
            &mut output,
            "relay_fanout_dropped_total",
            "counter",
            "Fan-out sends that failed because the recipient was closing.",
            self.fanout_dropped_total.load(Ordering::Relaxed),
        );
        push_scalar(
            &mut output,
            "relay_connections_opened_total",
            "counter",
            "Registered websocket connections.",
            self.connections_opened_total.load(Ordering::Relaxed),
        );
        push_scalar(
            &mut output,
            "relay_connections_closed_total",
            "counter",
            "Torn down websocket connections.",
            self.connections_closed_total.load(Ordering::Relaxed),
        );
        push_scalar(
            &mut output,
            "relay_active_connections",
            "gauge",
            "Currently registered websocket connections.",
            self.active_connections.load(Ordering::Relaxed).max(0),
        );
        push_scalar(
            &mut output,
            "relay_online_users",
            "gauge",
            "Users with at least one live connection.",
            self.online_users.load(Ordering::Relaxed).max(0),
        );

        output
    }
}

fn push_scalar(
    output: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    value: impl std::fmt::Display,
) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_event_kind(kind: &str) -> String {
    let normalized = kind.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{event=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
