//! Per-request traffic capture. Aggregation and reporting live elsewhere.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub user_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

#[async_trait]
pub trait TrafficRecorder: Send + Sync {
    async fn record(&self, record: TrafficRecord);
}

/// Emits each record as a structured `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTrafficRecorder;

#[async_trait]
impl TrafficRecorder for LogTrafficRecorder {
    async fn record(&self, record: TrafficRecord) {
        let user_id = record.user_id.map(|id| id.to_string());
        info!(
            target: "tollgate::traffic",
            method = %record.method,
            path = %record.path,
            status = record.status,
            latency_ms = record.latency_ms,
            user_id = user_id.as_deref(),
            ip = record.ip.as_deref(),
            user_agent = record.user_agent.as_deref(),
            request_id = record.request_id.as_deref(),
            "request"
        );
    }
}
