//! Metrics module
//!
//! Prometheus counters for upload sessions, chunk traffic and multipart
//! coordination.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    // Session metrics
    pub static ref UPLOADS_CREATED: Counter = register_counter!(
        "tus_uploads_created_total",
        "Total number of upload sessions created"
    ).unwrap();

    pub static ref DECLARED_BYTES_TOTAL: Counter = register_counter!(
        "tus_declared_bytes_total",
        "Sum of Upload-Length over created uploads"
    ).unwrap();

    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "tus_chunks_total",
        "Chunk applications by outcome",
        &["status"]
    ).unwrap();

    pub static ref CHUNK_BYTES_TOTAL: Counter = register_counter!(
        "tus_chunk_bytes_total",
        "Bytes committed through chunk applications"
    ).unwrap();

    pub static ref CHUNK_DURATION: Histogram = register_histogram!(
        "tus_chunk_duration_seconds",
        "Chunk application duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // Storage metrics
    pub static ref COMPLETED_UPLOADS: CounterVec = register_counter_vec!(
        "tus_uploads_completed_total",
        "Uploads finalized, by backend",
        &["backend"]
    ).unwrap();

    pub static ref MULTIPART_SESSIONS: CounterVec = register_counter_vec!(
        "tus_multipart_sessions_total",
        "Remote multipart sessions by lifecycle event",
        &["event"]  // "opened", "completed" or "aborted"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tus_errors_total",
        "Protocol errors returned to clients",
        &["type"]
    ).unwrap();
}

/// Record a created upload session
pub fn record_upload_created(declared_bytes: u64) {
    UPLOADS_CREATED.inc();
    DECLARED_BYTES_TOTAL.inc_by(declared_bytes as f64);
}

/// Record a committed chunk
pub fn record_chunk_success(bytes: u64, duration_secs: f64) {
    CHUNKS_TOTAL.with_label_values(&["success"]).inc();
    CHUNK_BYTES_TOTAL.inc_by(bytes as f64);
    CHUNK_DURATION.observe(duration_secs);
}

/// Record a chunk rejected by the backend
pub fn record_chunk_failure() {
    CHUNKS_TOTAL.with_label_values(&["failure"]).inc();
}

/// Record a finalized upload
pub fn record_upload_completed(backend: &str) {
    COMPLETED_UPLOADS.with_label_values(&[backend]).inc();
}

/// Record a multipart session lifecycle event
pub fn record_multipart_event(event: &str) {
    MULTIPART_SESSIONS.with_label_values(&[event]).inc();
}

/// Record a protocol error by kind
pub fn record_protocol_error(kind: &str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}
