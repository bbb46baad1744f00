//! Metering of this node's compute contribution.
//!
//! Counters feed downstream reward settlement, so they must be cheap to
//! bump from every handler and safe under concurrent writers. Snapshots
//! are eventually-consistent reports, not transactions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters recording per-request work.
#[derive(Debug, Default)]
pub struct ContributionMeter {
    inference_requests: AtomicU64,
    prompt_requests: AtomicU64,
    tensor_requests: AtomicU64,
    tokens_processed: AtomicU64,
    compute_time_ms: AtomicU64,
    bytes_transferred: AtomicU64,
    failures: AtomicU64,
    peak_memory_mib: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

/// Immutable view of the meter at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionSnapshot {
    pub inference_requests: u64,
    pub prompt_requests: u64,
    pub tensor_requests: u64,
    pub tokens_processed: u64,
    pub compute_time_ms: u64,
    pub bytes_transferred: u64,
    pub failures: u64,
    pub peak_memory_mib: u64,
    pub average_latency_ms: f64,
    pub score: f64,
}

impl ContributionMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed prompt request.
    pub fn record_prompt(&self, tokens: u64, compute_ms: u64, bytes: u64) {
        self.inference_requests.fetch_add(1, Ordering::Relaxed);
        self.prompt_requests.fetch_add(1, Ordering::Relaxed);
        self.tokens_processed.fetch_add(tokens, Ordering::Relaxed);
        self.record_common(compute_ms, bytes);
    }

    /// Record a completed tensor request.
    pub fn record_tensor(&self, compute_ms: u64, bytes: u64) {
        self.inference_requests.fetch_add(1, Ordering::Relaxed);
        self.tensor_requests.fetch_add(1, Ordering::Relaxed);
        self.record_common(compute_ms, bytes);
    }

    fn record_common(&self, compute_ms: u64, bytes: u64) {
        self.compute_time_ms.fetch_add(compute_ms, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(compute_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request. Touches nothing else.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the peak-memory watermark if `mib` exceeds it.
    pub fn update_peak_memory(&self, mib: u64) {
        let mut current = self.peak_memory_mib.load(Ordering::Relaxed);
        while mib > current {
            match self.peak_memory_mib.compare_exchange_weak(
                current,
                mib,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Produce an immutable snapshot.
    ///
    /// The latency count is loaded once and used for both the division
    /// guard and the divisor; other counters may be skewed by concurrent
    /// writers, which is acceptable for reporting.
    pub fn snapshot(&self) -> ContributionSnapshot {
        let inference_requests = self.inference_requests.load(Ordering::Relaxed);
        let tokens_processed = self.tokens_processed.load(Ordering::Relaxed);
        let compute_time_ms = self.compute_time_ms.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);

        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let latency_sum_ms = self.latency_sum_ms.load(Ordering::Relaxed);
        let average_latency_ms = latency_sum_ms as f64 / latency_count.max(1) as f64;

        let base = inference_requests as f64
            + tokens_processed as f64 * 0.1
            + compute_time_ms as f64 * 0.001;
        let multiplier = if failures == 0 { 1.2 } else { 1.0 };

        ContributionSnapshot {
            inference_requests,
            prompt_requests: self.prompt_requests.load(Ordering::Relaxed),
            tensor_requests: self.tensor_requests.load(Ordering::Relaxed),
            tokens_processed,
            compute_time_ms,
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            failures,
            peak_memory_mib: self.peak_memory_mib.load(Ordering::Relaxed),
            average_latency_ms,
            score: base * multiplier,
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.inference_requests.store(0, Ordering::Relaxed);
        self.prompt_requests.store(0, Ordering::Relaxed);
        self.tensor_requests.store(0, Ordering::Relaxed);
        self.tokens_processed.store(0, Ordering::Relaxed);
        self.compute_time_ms.store(0, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.peak_memory_mib.store(0, Ordering::Relaxed);
        self.latency_sum_ms.store(0, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
    }
}

impl ContributionSnapshot {
    /// Default persistence path: `~/.spindle/contribution.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".spindle")
            .join("contribution.json")
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "snapshot": self,
            "generated_at": chrono::Local::now().to_rfc3339(),
        })
    }

    /// Persist the snapshot for the `metrics` subcommand.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.to_json())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&path, json)
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        println!("\n{}", "Contribution".bold().cyan());
        println!("{}", "============".cyan());

        println!("\n{}", "Requests:".bold());
        println!(
            "  Total:               {}",
            self.inference_requests.to_string().green()
        );
        println!("  Prompt:              {}", self.prompt_requests);
        println!("  Tensor:              {}", self.tensor_requests);
        println!("  Failures:            {}", self.failures.to_string().red());

        println!("\n{}", "Work:".bold());
        println!("  Tokens Processed:    {}", self.tokens_processed);
        println!("  Compute Time:        {}ms", self.compute_time_ms);
        println!("  Bytes Transferred:   {}", self.bytes_transferred);
        println!("  Avg Latency:         {:.2}ms", self.average_latency_ms);
        println!("  Peak Memory:         {}MiB", self.peak_memory_mib);

        println!("\n{}", "Score:".bold());
        println!("  {:.3}", self.score);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_prompt() {
        let meter = ContributionMeter::new();
        meter.record_prompt(3, 40, 128);
        meter.record_prompt(2, 60, 64);

        let snap = meter.snapshot();
        assert_eq!(snap.inference_requests, 2);
        assert_eq!(snap.prompt_requests, 2);
        assert_eq!(snap.tensor_requests, 0);
        assert_eq!(snap.tokens_processed, 5);
        assert_eq!(snap.compute_time_ms, 100);
        assert_eq!(snap.bytes_transferred, 192);
        assert_eq!(snap.average_latency_ms, 50.0);
    }

    #[test]
    fn test_score_formula_with_bonus() {
        let meter = ContributionMeter::new();
        meter.record_prompt(10, 1000, 0);

        let snap = meter.snapshot();
        // (1 + 10*0.1 + 1000*0.001) * 1.2
        assert!((snap.score - 3.0 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_score_without_bonus_after_failure() {
        let meter = ContributionMeter::new();
        meter.record_prompt(10, 1000, 0);
        meter.record_failure();

        let snap = meter.snapshot();
        assert!((snap.score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_latency_guards_division() {
        let meter = ContributionMeter::new();
        assert_eq!(meter.snapshot().average_latency_ms, 0.0);
    }

    #[test]
    fn test_peak_memory_is_monotone() {
        let meter = ContributionMeter::new();
        meter.update_peak_memory(100);
        meter.update_peak_memory(50);
        meter.update_peak_memory(200);
        meter.update_peak_memory(150);
        assert_eq!(meter.snapshot().peak_memory_mib, 200);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let meter = ContributionMeter::new();
        meter.record_prompt(3, 40, 128);
        meter.record_tensor(10, 4096);
        meter.record_failure();
        meter.update_peak_memory(512);
        meter.reset();

        let snap = meter.snapshot();
        assert_eq!(snap.inference_requests, 0);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.peak_memory_mib, 0);
        assert_eq!(snap.average_latency_ms, 0.0);
        assert_eq!(snap.score, 0.0);
    }

    #[test]
    fn test_monotone_between_snapshots() {
        let meter = ContributionMeter::new();
        meter.record_tensor(10, 100);
        let first = meter.snapshot();
        meter.record_tensor(10, 100);
        meter.record_prompt(1, 5, 10);
        let second = meter.snapshot();

        assert!(second.inference_requests >= first.inference_requests);
        assert!(second.tokens_processed >= first.tokens_processed);
        assert!(second.compute_time_ms >= first.compute_time_ms);
        assert!(second.bytes_transferred >= first.bytes_transferred);
    }

    #[test]
    fn test_concurrent_writers() {
        let meter = Arc::new(ContributionMeter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let meter = meter.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    meter.record_tensor(1, 4);
                    meter.update_peak_memory(i % 97);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let snap = meter.snapshot();
        assert_eq!(snap.inference_requests, 8000);
        assert_eq!(snap.tensor_requests, 8000);
        assert_eq!(snap.bytes_transferred, 32_000);
        assert_eq!(snap.peak_memory_mib, 96);
    }

    #[test]
    fn test_snapshot_serializes() {
        let meter = ContributionMeter::new();
        meter.record_prompt(2, 10, 20);
        let snap = meter.snapshot();

        let json = serde_json::to_string(&snap).unwrap();
        let decoded: ContributionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snap);
    }
}
