//! Performance recorder for agent construction and stage execution.
//!
//! Samples are append-only and bounded; snapshots and recommendations are
//! derived on demand and never mutate the log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub const DEFAULT_SAMPLE_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Construction,
    Stage,
}

/// One timed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Role name for constructions, stage name for stages.
    pub subject: String,
    pub kind: SampleKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PerformanceSample {
    /// Sample ending now that started `duration_ms` ago.
    pub fn finished(subject: impl Into<String>, kind: SampleKind, duration_ms: u64) -> Self {
        let ended_at = Utc::now();
        Self {
            subject: subject.into(),
            kind,
            started_at: ended_at - chrono::Duration::milliseconds(duration_ms as i64),
            ended_at,
            duration_ms,
            success: true,
            cache_hit: false,
            error: None,
        }
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Aggregates for one subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectStats {
    pub kind: SampleKind,
    pub count: usize,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSnapshot {
    pub total_samples: usize,
    pub subjects: BTreeMap<String, SubjectStats>,
}

/// System pressure derived from recent measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Low,
    Medium,
    High,
}

const SLOW_STAGE_MS: f64 = 1_500.0;
const OVERLOADED_STAGE_MS: f64 = 5_000.0;
const FAILING_RATE: f64 = 0.3;

pub struct PerformanceRecorder {
    samples: Mutex<VecDeque<PerformanceSample>>,
    capacity: usize,
}

impl Default for PerformanceRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}

impl PerformanceRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_SAMPLE_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, sample: PerformanceSample) {
        debug!(
            subject = %sample.subject,
            kind = ?sample.kind,
            duration_ms = sample.duration_ms,
            success = sample.success,
            "performance sample"
        );
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Copy of the current log, oldest first.
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let samples = self.samples.lock();
        let mut grouped: BTreeMap<String, Vec<&PerformanceSample>> = BTreeMap::new();
        for sample in samples.iter() {
            grouped.entry(sample.subject.clone()).or_default().push(sample);
        }

        let subjects = grouped
            .into_iter()
            .map(|(subject, group)| {
                let count = group.len();
                let mut durations: Vec<u64> = group.iter().map(|s| s.duration_ms).collect();
                durations.sort_unstable();
                let successes = group.iter().filter(|s| s.success).count();
                let hits = group.iter().filter(|s| s.cache_hit).count();
                let stats = SubjectStats {
                    kind: group[count - 1].kind,
                    count,
                    success_rate: successes as f64 / count as f64,
                    cache_hit_rate: hits as f64 / count as f64,
                    avg_ms: durations.iter().sum::<u64>() as f64 / count as f64,
                    p50_ms: percentile(&durations, 0.50),
                    p95_ms: percentile(&durations, 0.95),
                    max_ms: durations[count - 1],
                };
                (subject, stats)
            })
            .collect();

        PerformanceSnapshot {
            total_samples: samples.len(),
            subjects,
        }
    }

    /// Human-readable hints derived from the snapshot.
    pub fn recommendations(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut hints = Vec::new();
        for (subject, stats) in &snapshot.subjects {
            match stats.kind {
                SampleKind::Construction => {
                    if stats.avg_ms > 1_000.0 && stats.cache_hit_rate < 0.5 {
                        hints.push(format!(
                            "'{}' takes {:.0}ms to build and rarely hits the cache; consider preloading it",
                            subject, stats.avg_ms
                        ));
                    }
                    if stats.success_rate < 1.0 {
                        hints.push(format!(
                            "'{}' failed {:.0}% of constructions; check its model configuration",
                            subject,
                            (1.0 - stats.success_rate) * 100.0
                        ));
                    }
                }
                SampleKind::Stage => {
                    if stats.success_rate < 1.0 - FAILING_RATE {
                        hints.push(format!(
                            "stage '{}' fails {:.0}% of the time",
                            subject,
                            (1.0 - stats.success_rate) * 100.0
                        ));
                    }
                    if stats.p95_ms as f64 > OVERLOADED_STAGE_MS {
                        hints.push(format!(
                            "stage '{}' p95 is {}ms; consider raising its timeout or lowering preload pressure",
                            subject, stats.p95_ms
                        ));
                    }
                }
            }
        }
        hints
    }

    /// Load level suggested by recent stage executions. Medium without data.
    pub fn suggested_load(&self) -> LoadLevel {
        let samples = self.samples.lock();
        let stages: Vec<&PerformanceSample> =
            samples.iter().filter(|s| s.kind == SampleKind::Stage).collect();
        if stages.is_empty() {
            return LoadLevel::Medium;
        }

        let failures = stages.iter().filter(|s| !s.success).count();
        let failure_rate = failures as f64 / stages.len() as f64;
        let avg_ms = stages.iter().map(|s| s.duration_ms).sum::<u64>() as f64 / stages.len() as f64;

        if failure_rate > FAILING_RATE || avg_ms > OVERLOADED_STAGE_MS {
            LoadLevel::High
        } else if avg_ms > SLOW_STAGE_MS {
            LoadLevel::Medium
        } else {
            LoadLevel::Low
        }
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded() {
        let recorder = PerformanceRecorder::new(3);
        for i in 0..5 {
            recorder.record(PerformanceSample::finished(format!("s{}", i), SampleKind::Stage, i));
        }
        let subjects: Vec<String> = recorder.samples().into_iter().map(|s| s.subject).collect();
        assert_eq!(subjects, vec!["s2", "s3", "s4"]);
    }

    #[test]
    fn snapshot_aggregates_per_subject() {
        let recorder = PerformanceRecorder::default();
        for ms in [10, 20, 30, 40] {
            recorder.record(PerformanceSample::finished("retriever", SampleKind::Construction, ms));
        }
        recorder.record(
            PerformanceSample::finished("retriever", SampleKind::Construction, 5)
                .with_cache_hit(true),
        );
        recorder.record(PerformanceSample::finished("retrieve", SampleKind::Stage, 100).failed("boom"));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_samples, 6);
        let retriever = &snapshot.subjects["retriever"];
        assert_eq!(retriever.count, 5);
        assert_eq!(retriever.max_ms, 40);
        assert_eq!(retriever.p50_ms, 20);
        assert!((retriever.cache_hit_rate - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.subjects["retrieve"].success_rate, 0.0);
    }

    #[test]
    fn load_follows_stage_health() {
        let recorder = PerformanceRecorder::default();
        assert_eq!(recorder.suggested_load(), LoadLevel::Medium);

        for _ in 0..10 {
            recorder.record(PerformanceSample::finished("embed", SampleKind::Stage, 50));
        }
        assert_eq!(recorder.suggested_load(), LoadLevel::Low);

        for _ in 0..10 {
            recorder.record(PerformanceSample::finished("embed", SampleKind::Stage, 50).failed("timeout"));
        }
        assert_eq!(recorder.suggested_load(), LoadLevel::High);
        assert!(!recorder.recommendations().is_empty());
    }
}
