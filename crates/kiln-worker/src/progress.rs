//! The two-stage weighted progress stream (§4.D, §9 design note).
//!
//! A small, synchronous value type: `stages` holds the weight of each
//! stage (e.g. `[0.8, 0.2]` for download/load), and `set_progress(f)`
//! interprets `f` — a fraction within the *current* stage — against the
//! cumulative weight of stages already completed. This keeps the state
//! machine's notion of progress independent of whatever transport actually
//! carries the number to the Progress Tracker.

#[derive(Debug, Clone)]
pub struct ProgressStream {
    /// Per-stage weight, summing to 1.0. `[0.8, 0.2]` matches the spec's
    /// `[0.0, 0.8, 1.0]` download/load boundaries.
    stages: Vec<f64>,
    current_stage: usize,
    /// Fraction completed within `current_stage`, in `[0.0, 1.0]`.
    stage_fraction: f64,
    pub label: Option<String>,
}

impl ProgressStream {
    /// `[0.0, 0.8, 1.0]` boundaries become stage weights `[0.8, 0.2]`.
    pub fn split_stages(boundaries: &[f64]) -> Self {
        let mut stages = Vec::with_capacity(boundaries.len().saturating_sub(1));
        for w in boundaries.windows(2) {
            stages.push(w[1] - w[0]);
        }
        Self {
            stages,
            current_stage: 0,
            stage_fraction: 0.0,
            label: None,
        }
    }

    pub fn download_load() -> Self {
        Self::split_stages(&[0.0, 0.8, 1.0])
    }

    /// Record progress `f` (0.0-1.0) within the current stage.
    pub fn set_progress(&mut self, f: f64, label: Option<&str>) {
        self.stage_fraction = f.clamp(0.0, 1.0);
        self.label = label.map(str::to_string);
    }

    /// Move to the next stage, resetting the in-stage fraction.
    pub fn advance_stage(&mut self) {
        if self.current_stage + 1 < self.stages.len() {
            self.current_stage += 1;
        }
        self.stage_fraction = 0.0;
    }

    /// Absolute fraction in `[0.0, 1.0]` across all stages.
    pub fn absolute_fraction(&self) -> f64 {
        let completed: f64 = self.stages[..self.current_stage].iter().sum();
        let current_weight = self.stages.get(self.current_stage).copied().unwrap_or(0.0);
        (completed + current_weight * self.stage_fraction).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_stages_matches_spec_boundaries() {
        let p = ProgressStream::download_load();
        assert_eq!(p.stages, vec![0.8, 0.2]);
    }

    #[test]
    fn absolute_fraction_interpolates_within_stage() {
        let mut p = ProgressStream::download_load();
        p.set_progress(0.5, None);
        assert!((p.absolute_fraction() - 0.4).abs() < 1e-9);

        p.advance_stage();
        p.set_progress(1.0, Some("Start to load model"));
        assert!((p.absolute_fraction() - 1.0).abs() < 1e-9);
    }
}
