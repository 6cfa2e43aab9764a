//! Empirical loading-progress probe. Driven from the render loop, it samples
//! cumulative byte progress across all scenes, flags per-scene stalls (no
//! byte movement while QUEUED or LOADING beyond a threshold) and their
//! recoveries, and exports the samples as a tab-separated report.

use crate::scene::store::SceneStore;
use crate::scene::types::SceneState;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub elapsed: Duration,
    pub bytes_received: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FaultSummary {
    pub duration: Duration,
    pub stalls: usize,
    pub recoveries: usize,
    pub max_stall: Duration,
    pub avg_throughput_bps: f64,
}

#[derive(Debug)]
struct SceneTrack {
    last_bytes: u64,
    stall_since: Option<Instant>,
    counted: bool,
}

pub struct FaultProbe {
    started: Instant,
    last_sample: Instant,
    sample_interval: Duration,
    stall_threshold: Duration,
    samples: Vec<Sample>,
    tracks: HashMap<String, SceneTrack>,
    stalls: usize,
    recoveries: usize,
    max_stall: Duration,
}

impl FaultProbe {
    pub fn start(sample_interval: Duration, stall_threshold: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_sample: now,
            sample_interval,
            stall_threshold,
            samples: Vec::new(),
            tracks: HashMap::new(),
            stalls: 0,
            recoveries: 0,
            max_stall: Duration::ZERO,
        }
    }

    /// Cheap no-op between sample points; call every frame. Returns the
    /// summary once every registered scene has reached LOADED.
    pub fn tick(&mut self, store: &SceneStore) -> Option<FaultSummary> {
        let now = Instant::now();
        if now.duration_since(self.last_sample) < self.sample_interval {
            return None;
        }
        self.last_sample = now;

        let snapshot = store.snapshot();
        let mut total = 0u64;
        let mut got = 0u64;
        let mut all_loaded = !snapshot.is_empty();

        for desc in &snapshot {
            let (scene_total, scene_got) = desc.lock().byte_totals();
            total += scene_total;
            got += scene_got;

            let state = desc.state.load();
            if state != SceneState::Loaded {
                all_loaded = false;
            }

            let track = self
                .tracks
                .entry(desc.scene_id.clone())
                .or_insert(SceneTrack {
                    last_bytes: scene_got,
                    stall_since: None,
                    counted: false,
                });

            if scene_got > track.last_bytes {
                track.last_bytes = scene_got;
                if let Some(since) = track.stall_since.take() {
                    if track.counted {
                        let stalled_for = now.duration_since(since);
                        self.recoveries += 1;
                        self.max_stall = self.max_stall.max(stalled_for);
                        tracing::info!(
                            scene_id = %desc.scene_id,
                            stalled_for_ms = stalled_for.as_millis() as u64,
                            "Scene recovered from stall"
                        );
                    }
                }
                track.counted = false;
            } else if matches!(state, SceneState::Queued | SceneState::Loading) {
                let since = *track.stall_since.get_or_insert(now);
                if !track.counted && now.duration_since(since) >= self.stall_threshold {
                    track.counted = true;
                    self.stalls += 1;
                    tracing::warn!(scene_id = %desc.scene_id, "Scene load stalled");
                }
            }
        }

        self.samples.push(Sample {
            elapsed: now.duration_since(self.started),
            bytes_received: got,
            total_bytes: total,
        });

        all_loaded.then(|| self.summary())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn summary(&self) -> FaultSummary {
        let duration = self
            .samples
            .last()
            .map(|s| s.elapsed)
            .unwrap_or(Duration::ZERO);
        let received = self.samples.last().map(|s| s.bytes_received).unwrap_or(0);
        let avg_throughput_bps = if duration.as_secs_f64() > 0.0 {
            received as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        FaultSummary {
            duration,
            stalls: self.stalls,
            recoveries: self.recoveries,
            max_stall: self.max_stall,
            avg_throughput_bps,
        }
    }

    /// Write the sample table plus a summary line.
    pub fn export(&self, path: &Path) -> std::io::Result<()> {
        let mut out = std::fs::File::create(path)?;
        writeln!(out, "Fault Test Results")?;
        writeln!(out, "time_s\tbytes_received\ttotal_bytes")?;
        for s in &self.samples {
            writeln!(
                out,
                "{:.3}\t{}\t{}",
                s.elapsed.as_secs_f64(),
                s.bytes_received,
                s.total_bytes
            )?;
        }

        let summary = self.summary();
        writeln!(
            out,
            "summary: duration={:.3}s stalls={} recoveries={} max_stall={:.3}s avg_throughput={:.0} B/s",
            summary.duration.as_secs_f64(),
            summary.stalls,
            summary.recoveries,
            summary.max_stall.as_secs_f64(),
            summary.avg_throughput_bps
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::types::ModelProgress;
    use std::sync::Arc;

    fn store_with_one_model(size: u64) -> (SceneStore, Arc<ModelProgress>) {
        let store = SceneStore::new();
        let desc = store.get_or_create("s1");
        let progress = Arc::new(ModelProgress::new("m".into(), "m.obj".into(), size));
        desc.lock().adopt(vec![progress.clone()], Vec::new());
        desc.state.store(SceneState::Loading);
        (store, progress)
    }

    #[test]
    fn detects_a_stall_and_its_recovery() {
        let (store, progress) = store_with_one_model(100);
        let mut probe = FaultProbe::start(Duration::from_millis(1), Duration::from_millis(10));

        progress.set_bytes_received(10);
        std::thread::sleep(Duration::from_millis(2));
        assert!(probe.tick(&store).is_none());

        // No byte movement past the threshold: one stall, counted once.
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(5));
            probe.tick(&store);
        }
        assert_eq!(probe.summary().stalls, 1);
        assert_eq!(probe.summary().recoveries, 0);

        // Progress resumes: one recovery with a positive stall duration.
        progress.set_bytes_received(50);
        std::thread::sleep(Duration::from_millis(2));
        probe.tick(&store);
        assert_eq!(probe.summary().recoveries, 1);
        assert!(probe.summary().max_stall > Duration::ZERO);
    }

    #[test]
    fn completion_returns_a_summary() {
        let (store, progress) = store_with_one_model(100);
        let mut probe = FaultProbe::start(Duration::from_millis(1), Duration::from_secs(3));

        progress.set_bytes_received(100);
        store.get("s1").unwrap().state.store(SceneState::Loaded);

        std::thread::sleep(Duration::from_millis(2));
        let summary = probe.tick(&store).expect("all scenes loaded");
        assert_eq!(summary.stalls, 0);
        assert!(!probe.samples().is_empty());
    }

    #[test]
    fn export_writes_the_sample_table() {
        let (store, progress) = store_with_one_model(100);
        let mut probe = FaultProbe::start(Duration::from_millis(1), Duration::from_secs(3));
        progress.set_bytes_received(40);
        std::thread::sleep(Duration::from_millis(2));
        probe.tick(&store);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fault_test_results.txt");
        probe.export(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("Fault Test Results"));
        assert!(contents.contains("time_s\tbytes_received\ttotal_bytes"));
        assert!(contents.contains("\t40\t100"));
        assert!(contents.lines().last().unwrap().starts_with("summary:"));
    }
}
