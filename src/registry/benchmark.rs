//! Benchmarking capability for discovered models.
//!
//! Benchmarking is pluggable: the registry takes any [`Benchmarker`] and
//! never assumes how the numbers were obtained. The default
//! [`EstimatingBenchmarker`] derives deterministic figures from model size
//! and format, so tier assignment is reproducible across runs without
//! loading a single model into memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;

use super::discovery::DiscoveredModel;
use super::{BackendId, Benchmark, ModelFormat};

/// A benchmark attempt failed for one model.
///
/// Benchmark failures are per-model: the registry logs and skips the model,
/// they never abort a refresh cycle.
#[derive(Error, Debug)]
#[error("benchmark failed for {id}: {reason}")]
pub struct BenchmarkError {
    /// The model that failed to benchmark.
    pub id: BackendId,
    /// What went wrong.
    pub reason: String,
}

/// Produces benchmark measurements for discovered models.
///
/// Object-safe so the registry can hold `Arc<dyn Benchmarker>`.
#[async_trait]
pub trait Benchmarker: Send + Sync {
    /// Measure (or estimate) one model's serving characteristics.
    async fn benchmark(&self, model: &DiscoveredModel) -> Result<Benchmark, BenchmarkError>;
}

// ── Estimating benchmarker ───────────────────────────────────────────────

/// Derives benchmark figures from model size and format alone.
///
/// The estimate is a pure function of the model's metadata: the same file
/// always lands in the same tier. Figures are calibrated for a single-node
/// workstation serving quantized local models.
#[derive(Debug, Clone, Default)]
pub struct EstimatingBenchmarker;

impl EstimatingBenchmarker {
    /// Create a new estimator.
    pub fn new() -> Self {
        Self
    }

    /// Format-specific latency multiplier. GGUF (quantized, llama.cpp) is
    /// the baseline; raw `.bin` weights are the slowest to serve.
    fn format_latency_factor(format: ModelFormat) -> f64 {
        match format {
            ModelFormat::Gguf => 1.0,
            ModelFormat::Mlx => 1.1,
            ModelFormat::Safetensors => 1.4,
            ModelFormat::Bin => 1.8,
            ModelFormat::Unknown => 2.0,
        }
    }

    /// Estimate one model. Deterministic.
    fn estimate(model: &DiscoveredModel) -> Benchmark {
        let size_gb = model.size_bytes as f64 / 1_073_741_824.0;
        let factor = Self::format_latency_factor(model.format);

        // Latency grows roughly linearly with parameter count; ~300ms of
        // fixed per-request overhead regardless of size.
        let avg_response_time_ms = (300.0 + size_gb * 900.0 * factor) as u64;

        // Quality saturates with size: a 1GB model scores ~0.55, a 30GB
        // model ~0.92. log2(size + 1) keeps sub-GB models above the floor.
        let quality_score = (0.45 + 0.095 * (size_gb + 1.0).log2()).clamp(0.3, 0.95);

        // Resident memory runs ~20% above file size for KV cache and
        // runtime overhead.
        let memory_mb = ((model.size_bytes as f64 * 1.2) / 1_048_576.0) as u64;

        // Cold start is dominated by reading weights off disk (~1GB/s)
        // plus a fixed process-spawn cost.
        let warmup_ms = (800.0 + size_gb * 1_000.0) as u64;

        // Throughput falls off with size; quantized formats decode faster.
        let throughput_tok_per_sec = (120.0 / (1.0 + size_gb * 0.6) / factor).max(1.0);

        Benchmark {
            avg_response_time_ms,
            quality_score,
            memory_mb,
            warmup_ms,
            throughput_tok_per_sec,
            measured_at: SystemTime::now(),
        }
    }
}

#[async_trait]
impl Benchmarker for EstimatingBenchmarker {
    async fn benchmark(&self, model: &DiscoveredModel) -> Result<Benchmark, BenchmarkError> {
        if model.size_bytes == 0 {
            return Err(BenchmarkError {
                id: model.id.clone(),
                reason: "zero-byte model file".to_string(),
            });
        }
        Ok(Self::estimate(model))
    }
}

// ── Fixed benchmarker ────────────────────────────────────────────────────

/// Returns pre-seeded benchmarks, for tests and offline tier planning.
#[derive(Debug, Clone)]
pub struct FixedBenchmarker {
    default: Benchmark,
    by_id: HashMap<BackendId, Benchmark>,
}

impl FixedBenchmarker {
    /// Create a benchmarker that answers `default` for every model.
    pub fn new(default: Benchmark) -> Self {
        Self {
            default,
            by_id: HashMap::new(),
        }
    }

    /// Override the answer for one model id.
    pub fn with(mut self, id: BackendId, benchmark: Benchmark) -> Self {
        self.by_id.insert(id, benchmark);
        self
    }
}

#[async_trait]
impl Benchmarker for FixedBenchmarker {
    async fn benchmark(&self, model: &DiscoveredModel) -> Result<Benchmark, BenchmarkError> {
        Ok(self
            .by_id
            .get(&model.id)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, format: ModelFormat, size_bytes: u64) -> DiscoveredModel {
        DiscoveredModel {
            id: BackendId::new(id),
            display_name: id.to_string(),
            format,
            size_bytes,
            path: None,
        }
    }

    #[tokio::test]
    async fn test_estimate_is_deterministic_apart_from_timestamp() {
        let b = EstimatingBenchmarker::new();
        let m = model("m", ModelFormat::Gguf, 4 * 1_073_741_824);
        let a = b.benchmark(&m).await.expect("estimate");
        let c = b.benchmark(&m).await.expect("estimate");
        assert_eq!(a.avg_response_time_ms, c.avg_response_time_ms);
        assert!((a.quality_score - c.quality_score).abs() < f64::EPSILON);
        assert_eq!(a.memory_mb, c.memory_mb);
    }

    #[tokio::test]
    async fn test_bigger_models_are_slower_and_better() {
        let b = EstimatingBenchmarker::new();
        let small = b
            .benchmark(&model("s", ModelFormat::Gguf, 1_073_741_824))
            .await
            .expect("estimate");
        let large = b
            .benchmark(&model("l", ModelFormat::Gguf, 20 * 1_073_741_824))
            .await
            .expect("estimate");
        assert!(large.avg_response_time_ms > small.avg_response_time_ms);
        assert!(large.quality_score > small.quality_score);
        assert!(large.throughput_tok_per_sec < small.throughput_tok_per_sec);
    }

    #[tokio::test]
    async fn test_raw_bin_slower_than_gguf_at_equal_size() {
        let b = EstimatingBenchmarker::new();
        let size = 4 * 1_073_741_824;
        let gguf = b
            .benchmark(&model("g", ModelFormat::Gguf, size))
            .await
            .expect("estimate");
        let bin = b
            .benchmark(&model("b", ModelFormat::Bin, size))
            .await
            .expect("estimate");
        assert!(bin.avg_response_time_ms > gguf.avg_response_time_ms);
    }

    #[tokio::test]
    async fn test_quality_stays_in_bounds() {
        let b = EstimatingBenchmarker::new();
        for size in [1, 1_048_576, 1_073_741_824, 100 * 1_073_741_824] {
            let bench = b
                .benchmark(&model("m", ModelFormat::Gguf, size))
                .await
                .expect("estimate");
            assert!((0.3..=0.95).contains(&bench.quality_score));
        }
    }

    #[tokio::test]
    async fn test_zero_byte_model_is_rejected() {
        let b = EstimatingBenchmarker::new();
        let err = b
            .benchmark(&model("empty", ModelFormat::Gguf, 0))
            .await
            .expect_err("zero-byte model must fail");
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_fixed_benchmarker_per_id_override() {
        let default = Benchmark {
            avg_response_time_ms: 1_000,
            quality_score: 0.7,
            memory_mb: 4_096,
            warmup_ms: 2_000,
            throughput_tok_per_sec: 40.0,
            measured_at: SystemTime::now(),
        };
        let special = Benchmark {
            avg_response_time_ms: 200,
            ..default.clone()
        };
        let b = FixedBenchmarker::new(default.clone()).with(BackendId::new("fast"), special);

        let got_default = b
            .benchmark(&model("other", ModelFormat::Gguf, 1))
            .await
            .expect("fixed");
        assert_eq!(got_default.avg_response_time_ms, 1_000);

        let got_special = b
            .benchmark(&model("fast", ModelFormat::Gguf, 1))
            .await
            .expect("fixed");
        assert_eq!(got_special.avg_response_time_ms, 200);
    }
}
