//! Progress reporting for the batch stages.
//!
//! Disaggregation, scoring and hex mapping fan their work out over rayon
//! and report each finished district or area through [`StageProgress`].
//! The CLI renders it with `indicatif`; tests pass [`NullProgress`].

/// What a stage counts while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnit {
    /// Coarse areas with a reported rate.
    Districts,
    /// Fine areas.
    Areas,
    /// Stages of a full pipeline run.
    Stages,
}

impl WorkUnit {
    /// Plural label shown next to the count.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Districts => "districts",
            Self::Areas => "areas",
            Self::Stages => "stages",
        }
    }
}

/// Receives progress from one stage. Called from rayon workers.
pub trait StageProgress: Send + Sync {
    /// The stage is about to process `total` units.
    fn start(&self, total: u64, unit: WorkUnit);

    /// `count` more units are finished.
    fn advance(&self, count: u64);

    /// The stage finished; `summary` is its one-line result.
    fn done(&self, summary: &str);
}

/// Discards progress.
pub struct NullProgress;

impl StageProgress for NullProgress {
    fn start(&self, _total: u64, _unit: WorkUnit) {}
    fn advance(&self, _count: u64) {}
    fn done(&self, _summary: &str) {}
}
