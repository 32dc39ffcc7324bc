use prometheus::{
    exponential_buckets, register_counter, register_counter_vec, register_gauge,
    register_histogram, Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts,
};
use std::sync::LazyLock;

// Counters
pub static RECORDS_PARSED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "capingest_records_parsed_total",
        "The total number of decoder lines parsed into packet records"
    ))
    .unwrap()
});

pub static MALFORMED_LINES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "capingest_malformed_lines_total",
        "The total number of decoder lines skipped as malformed"
    ))
    .unwrap()
});

pub static CHUNKS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "capingest_chunks_total",
            "Total number of chunks decoded, by outcome"
        ),
        &["outcome"]
    )
    .unwrap()
});

pub static INGEST_RUNS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new("capingest_runs_total", "Total number of ingestion runs, by outcome"),
        &["outcome"]
    )
    .unwrap()
});

// Histograms
pub static CHUNK_DECODE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(HistogramOpts::new(
        "capingest_chunk_decode_duration_seconds",
        "Wall time spent decoding and parsing one chunk"
    )
    .buckets(exponential_buckets(0.01, 2.0, 16).unwrap()))
    .unwrap()
});

// Gauges
pub static INTERNED_STRINGS: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(Opts::new(
        "capingest_interned_strings",
        "Distinct strings held by the string pool of the last run"
    ))
    .unwrap()
});

pub const CHUNK_OUTCOMES: [&str; 5] = ["ok", "failed", "timed_out", "cancelled", "malformed"];

/// Initialize all metrics with default values
pub fn init_metrics() {
    for outcome in CHUNK_OUTCOMES {
        CHUNKS.with_label_values(&[outcome]).inc_by(0.0);
    }
    for outcome in ["completed", "failed"] {
        INGEST_RUNS.with_label_values(&[outcome]).inc_by(0.0);
    }
    RECORDS_PARSED.inc_by(0.0);
    MALFORMED_LINES.inc_by(0.0);
    INTERNED_STRINGS.set(0.0);
    LazyLock::force(&CHUNK_DECODE_DURATION);
}
