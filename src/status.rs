//! Read-only tenant diagnostics.
//!
//! [`MemoryStatus`] is assembled by the manager from the store, the
//! provider selection and the last sync. `memctl status` prints it as a
//! table or, with `--json`, serializes it as-is.

use serde::Serialize;

use bridge_memory_core::models::SourceCounts;

use crate::embedding::batch::BatchTelemetry;
use crate::embedding::ProviderStatus;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub entries: u64,
    /// `0` means unbounded.
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FtsStatus {
    pub enabled: bool,
    pub available: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStatus {
    pub enabled: bool,
    pub available: bool,
    pub dims: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub tenant: String,
    pub dirty: bool,
    pub sources: Vec<String>,
    pub extra_paths: Vec<String>,
    pub counts: Vec<SourceCounts>,
    pub files: u64,
    pub chunks: u64,
    pub sessions_tracked: usize,
    pub provider: ProviderStatus,
    pub cache: CacheStatus,
    pub fts: FtsStatus,
    pub vector: VectorStatus,
    pub batch: BatchTelemetry,
    pub last_sync: Option<SyncReport>,
    pub last_sync_error: Option<String>,
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Print a human-readable summary to stdout.
pub fn print_status(status: &MemoryStatus) {
    println!("Memory status: {}", status.tenant);
    println!("================================");
    println!();
    println!("  Dirty:       {}", yes_no(status.dirty));
    println!("  Sources:     {}", status.sources.join(", "));
    if !status.extra_paths.is_empty() {
        println!("  Extra paths: {}", status.extra_paths.join(", "));
    }
    println!("  Files:       {}", status.files);
    println!("  Chunks:      {}", status.chunks);
    println!("  Sessions:    {}", status.sessions_tracked);
    println!();

    println!("  {:<12} {:>8} {:>8}", "SOURCE", "FILES", "CHUNKS");
    for c in &status.counts {
        println!("  {:<12} {:>8} {:>8}", c.source, c.files, c.chunks);
    }
    println!();

    let p = &status.provider;
    println!(
        "  Provider:    {} (requested {})",
        or_dash(p.provider.as_deref()),
        p.requested
    );
    println!("  Model:       {}", or_dash(p.model.as_deref()));
    if let Some(from) = &p.fallback_from {
        println!(
            "  Fallback:    from {} ({})",
            from,
            or_dash(p.fallback_reason.as_deref())
        );
    }
    if let Some(err) = &p.error {
        println!("  Provider error: {}", err);
    }
    println!();

    println!(
        "  Cache:       {} entries (max {}, enabled {})",
        status.cache.entries,
        if status.cache.max_entries == 0 {
            "unbounded".to_string()
        } else {
            status.cache.max_entries.to_string()
        },
        yes_no(status.cache.enabled)
    );
    println!(
        "  FTS:         enabled {}, available {}{}",
        yes_no(status.fts.enabled),
        yes_no(status.fts.available),
        status
            .fts
            .error
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default()
    );
    println!(
        "  Vector:      enabled {}, available {}, dims {}{}",
        yes_no(status.vector.enabled),
        yes_no(status.vector.available),
        status
            .vector
            .dims
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into()),
        status
            .vector
            .error
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default()
    );

    let b = &status.batch;
    if b.enabled {
        println!(
            "  Batch:       active {}, failures {}/{}, wait {}, concurrency {}, poll {}ms, timeout {}m",
            yes_no(b.active),
            b.failures,
            b.limit,
            yes_no(b.wait),
            b.concurrency,
            b.poll_interval_ms,
            b.timeout_minutes
        );
        if let Some(err) = &b.last_error {
            println!(
                "  Batch error: {} ({})",
                err,
                or_dash(b.last_provider.as_deref())
            );
        }
    }
    println!();

    match &status.last_sync {
        Some(s) => println!(
            "  Last sync:   {} (generation {}, {} indexed, {} removed, {} failed, {}ms)",
            chrono::DateTime::from_timestamp(s.finished_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            s.generation,
            s.indexed,
            s.removed,
            s.failed.len(),
            s.duration_ms
        ),
        None => println!("  Last sync:   never (this process)"),
    }
    if let Some(err) = &status.last_sync_error {
        println!("  Sync error:  {}", err);
    }
}
