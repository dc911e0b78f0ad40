//! Constraint filtering and optimization-based resource selection.
//!
//! Selection is a pure function of a [`CatalogSnapshot`], the task
//! descriptor and the in-flight load overlay. It never calls a provider and
//! never retries; the scheduler owns both.
//!
//! ```text
//!   Init ──→ Filtering ──→ Scoring ──→ Assigned
//!                │
//!                └──→ Infeasible
//! ```
//!
//! ## Modes
//!
//! | Mode | Primary | Tie-break | Final tie-break |
//! |------|---------|-----------|-----------------|
//! | `HighQuality` | quality desc | queue asc | id asc |
//! | `HighSpeed` | queue asc | quality desc | id asc |
//! | `Balanced` | weighted score desc | | id asc |
//!
//! The balanced score is
//! `w_q·quality − w_e·error_rate − w_d·norm(queue) − w_c·norm(cost)`, where
//! `norm(x) = x / max(x)` over the feasible set (0 when the max is 0).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::CatalogSnapshot;
use crate::error::{SchedulerError, SchedulerResult};
use crate::matching::{ExactMatcher, GreedyMatcher, Matcher, ScoreMatrix};
use crate::pool::PoolId;
use crate::resource::{QuantumResource, ResourceId};
use crate::task::TaskDescriptor;

/// Scales the secondary criterion of the lexicographic modes when they are
/// collapsed into a scalar for batch matching.
const TIE_BREAK_SCALE: f64 = 1e-3;

/// Optimization objective applied after constraint filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    HighQuality,
    HighSpeed,
    #[default]
    Balanced,
}

/// Weights of the balanced score. All must be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub quality: f64,
    pub error_rate: f64,
    pub queue: f64,
    pub cost: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            quality: 1.0,
            error_rate: 1.0,
            queue: 1.0,
            cost: 1.0,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> SchedulerResult<()> {
        let weights = [
            ("quality", self.quality),
            ("error_rate", self.error_rate),
            ("queue", self.queue),
            ("cost", self.cost),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(SchedulerError::Configuration(format!(
                    "scoring weight '{name}' must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Tasks dispatched by this scheduler that a refreshed queue depth does not
/// reflect yet. Added to each resource's queue depth during selection.
#[derive(Debug, Default)]
pub struct InflightLoad {
    counts: DashMap<ResourceId, u32>,
}

impl InflightLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ResourceId) -> u32 {
        self.counts.get(id).map_or(0, |c| *c)
    }

    pub fn increment(&self, id: &ResourceId) {
        *self.counts.entry(id.clone()).or_insert(0) += 1;
    }

    pub fn decrement(&self, id: &ResourceId) {
        self.counts.remove_if_mut(id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// Total in-flight tasks across all resources.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| u64::from(*c)).sum()
    }
}

/// Stage reached by a selection, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPhase {
    Init,
    Filtering,
    Infeasible,
    Scoring,
    Assigned,
}

/// What the selector needs to know about one task.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub descriptor: &'a TaskDescriptor,
    pub mode: OptimizationMode,
    /// Resources ruled out by an earlier dispatch attempt.
    pub excluded_resources: &'a BTreeSet<ResourceId>,
}

impl<'a> SelectionRequest<'a> {
    /// A request using the descriptor's mode, or `default_mode` if it has none.
    pub fn new(
        descriptor: &'a TaskDescriptor,
        default_mode: OptimizationMode,
        excluded_resources: &'a BTreeSet<ResourceId>,
    ) -> Self {
        Self {
            descriptor,
            mode: descriptor.optimization_mode.unwrap_or(default_mode),
            excluded_resources,
        }
    }
}

/// Why resources were dropped by the constraint filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub considered: usize,
    pub capacity: usize,
    pub capabilities: usize,
    pub unavailable: usize,
    pub excluded: usize,
    pub stale: usize,
}

impl FilterReport {
    fn reason(&self, descriptor: &TaskDescriptor) -> String {
        if self.considered == 0 {
            return "catalog holds no resources".to_string();
        }
        format!(
            "0 of {} resources feasible (capacity < {}: {}, missing capabilities: {}, \
             unavailable: {}, excluded: {}, stale: {})",
            self.considered,
            descriptor.required_capacity,
            self.capacity,
            self.capabilities,
            self.unavailable,
            self.excluded,
            self.stale
        )
    }
}

/// A feasible resource with its effective queue depth.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub resource: &'a QuantumResource,
    /// Reported queue depth plus local in-flight tasks.
    pub effective_queue: u32,
}

/// Normalization maxima over a feasible set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Normalizer {
    max_queue: u32,
    max_cost: f64,
}

impl Normalizer {
    pub fn over(candidates: &[Candidate<'_>]) -> Self {
        candidates.iter().fold(Self::default(), |acc, c| Self {
            max_queue: acc.max_queue.max(c.effective_queue),
            max_cost: acc.max_cost.max(c.resource.cost_weight),
        })
    }

    pub fn queue(&self, queue: u32) -> f64 {
        if self.max_queue == 0 {
            0.0
        } else {
            f64::from(queue) / f64::from(self.max_queue)
        }
    }

    pub fn cost(&self, cost: f64) -> f64 {
        if self.max_cost <= 0.0 {
            0.0
        } else {
            cost / self.max_cost
        }
    }
}

/// Ranks feasible resources.
pub trait Scorer: Send + Sync {
    /// Scalar objective, higher is better. Used for batch matching.
    fn score(&self, candidate: &Candidate<'_>, norm: &Normalizer) -> f64;

    /// Total order for single-task selection. `Less` means `a` is preferred.
    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>, norm: &Normalizer) -> Ordering {
        self.score(b, norm)
            .total_cmp(&self.score(a, norm))
            .then_with(|| a.resource.id.cmp(&b.resource.id))
    }
}

/// The built-in scorer for an [`OptimizationMode`].
#[derive(Debug, Clone, Copy)]
pub struct ModeScorer {
    pub mode: OptimizationMode,
    pub weights: ScoringWeights,
}

impl Scorer for ModeScorer {
    fn score(&self, c: &Candidate<'_>, norm: &Normalizer) -> f64 {
        let quality = c.resource.quality_score;
        let queue = norm.queue(c.effective_queue);
        match self.mode {
            OptimizationMode::HighQuality => quality - TIE_BREAK_SCALE * queue,
            OptimizationMode::HighSpeed => -queue + TIE_BREAK_SCALE * quality,
            OptimizationMode::Balanced => {
                let w = &self.weights;
                w.quality * quality
                    - w.error_rate * c.resource.error_rate
                    - w.queue * queue
                    - w.cost * norm.cost(c.resource.cost_weight)
            }
        }
    }

    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>, norm: &Normalizer) -> Ordering {
        let (ra, rb) = (a.resource, b.resource);
        let by_id = || ra.id.cmp(&rb.id);
        match self.mode {
            OptimizationMode::HighQuality => rb
                .quality_score
                .total_cmp(&ra.quality_score)
                .then(a.effective_queue.cmp(&b.effective_queue))
                .then_with(by_id),
            OptimizationMode::HighSpeed => a
                .effective_queue
                .cmp(&b.effective_queue)
                .then(rb.quality_score.total_cmp(&ra.quality_score))
                .then_with(by_id),
            OptimizationMode::Balanced => self
                .score(b, norm)
                .total_cmp(&self.score(a, norm))
                .then_with(by_id),
        }
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub resource: QuantumResource,
    pub score: f64,
    pub mode: OptimizationMode,
    /// Size of the feasible set the resource was picked from.
    pub feasible: usize,
    pub effective_queue: u32,
    pub phases: Vec<SelectionPhase>,
}

impl Selection {
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource.id
    }

    pub fn pool_id(&self) -> &PoolId {
        &self.resource.pool_id
    }
}

/// Result of a batch selection: one entry per request, in request order.
#[derive(Debug)]
pub struct BatchAssignment {
    pub assignments: Vec<SchedulerResult<Selection>>,
    /// `true` when the greedy matcher was used and the total score may be
    /// below the optimum.
    pub approximate: bool,
}

impl BatchAssignment {
    pub fn assigned(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_ok()).count()
    }
}

/// Filters, scores and selects resources.
#[derive(Clone)]
pub struct ResourceSelector {
    weights: ScoringWeights,
    ttl: chrono::Duration,
    exact_match_limit: usize,
    scorer: Option<Arc<dyn Scorer>>,
    matcher: Option<Arc<dyn Matcher>>,
}

impl std::fmt::Debug for ResourceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSelector")
            .field("weights", &self.weights)
            .field("ttl", &self.ttl)
            .field("exact_match_limit", &self.exact_match_limit)
            .field("custom_scorer", &self.scorer.is_some())
            .field("custom_matcher", &self.matcher.is_some())
            .finish()
    }
}

impl ResourceSelector {
    pub fn new(weights: ScoringWeights, ttl: std::time::Duration, exact_match_limit: usize) -> Self {
        Self {
            weights,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200)),
            exact_match_limit,
            scorer: None,
            matcher: None,
        }
    }

    /// Replaces the built-in mode scorers for every mode.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Forces one matcher for every batch size.
    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    fn scorer(&self, mode: OptimizationMode) -> Arc<dyn Scorer> {
        match &self.scorer {
            Some(custom) => Arc::clone(custom),
            None => Arc::new(ModeScorer {
                mode,
                weights: self.weights,
            }),
        }
    }

    fn matcher(&self, cells: usize) -> Arc<dyn Matcher> {
        match &self.matcher {
            Some(custom) => Arc::clone(custom),
            None if cells <= self.exact_match_limit => Arc::new(ExactMatcher),
            None => Arc::new(GreedyMatcher),
        }
    }

    /// Resources satisfying every hard constraint of `request`, sorted by id.
    pub fn filter<'s>(
        &self,
        snapshot: &'s CatalogSnapshot,
        request: &SelectionRequest<'_>,
        inflight: &InflightLoad,
        now: DateTime<Utc>,
    ) -> (Vec<Candidate<'s>>, FilterReport) {
        let descriptor = request.descriptor;
        let mut report = FilterReport::default();
        let mut feasible = Vec::new();

        for resource in snapshot.resources() {
            report.considered += 1;
            if resource.capacity < descriptor.required_capacity {
                report.capacity += 1;
            } else if !resource
                .capabilities
                .is_superset(&descriptor.required_capabilities)
            {
                report.capabilities += 1;
            } else if descriptor.excluded_pools.contains(&resource.pool_id)
                || request.excluded_resources.contains(&resource.id)
            {
                report.excluded += 1;
            } else if resource.is_stale(now, self.ttl) {
                report.stale += 1;
            } else if !resource.available {
                report.unavailable += 1;
            } else {
                feasible.push(Candidate {
                    resource,
                    effective_queue: resource.queue_depth.saturating_add(inflight.get(&resource.id)),
                });
            }
        }
        feasible.sort_by(|a, b| a.resource.id.cmp(&b.resource.id));
        (feasible, report)
    }

    /// Picks the best resource for one task.
    pub fn select(
        &self,
        snapshot: &CatalogSnapshot,
        request: &SelectionRequest<'_>,
        inflight: &InflightLoad,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Selection> {
        let correlation_id = &request.descriptor.correlation_id;
        if !snapshot.is_bootstrapped() {
            return Err(SchedulerError::SelectorNotInitialized(
                "no catalog snapshot has been published".into(),
            ));
        }

        let mut phases = vec![SelectionPhase::Init, SelectionPhase::Filtering];
        let (feasible, report) = self.filter(snapshot, request, inflight, now);
        debug!(
            correlation_id = %correlation_id,
            feasible = feasible.len(),
            considered = report.considered,
            stale = report.stale,
            "Filtered resources"
        );
        if feasible.is_empty() {
            phases.push(SelectionPhase::Infeasible);
            return Err(SchedulerError::infeasible(
                correlation_id.clone(),
                report.reason(request.descriptor),
            ));
        }

        phases.push(SelectionPhase::Scoring);
        let scorer = self.scorer(request.mode);
        let norm = Normalizer::over(&feasible);
        let best = feasible
            .iter()
            .min_by(|a, b| scorer.compare(a, b, &norm))
            .copied()
            .ok_or_else(|| SchedulerError::infeasible(correlation_id.clone(), "empty feasible set"))?;

        phases.push(SelectionPhase::Assigned);
        let selection = Selection {
            resource: best.resource.clone(),
            score: scorer.score(&best, &norm),
            mode: request.mode,
            feasible: feasible.len(),
            effective_queue: best.effective_queue,
            phases,
        };
        debug!(
            correlation_id = %correlation_id,
            resource = %selection.resource.id,
            mode = ?selection.mode,
            score = selection.score,
            "Selected resource"
        );
        Ok(selection)
    }

    /// Assigns a batch of tasks jointly.
    ///
    /// Each resource offers `headroom` slots (queue limit minus queue depth
    /// and in-flight tasks). Slot `k` of a resource is scored as if `k`
    /// batch tasks were already queued there, so the matcher spreads load.
    pub fn select_batch(
        &self,
        snapshot: &CatalogSnapshot,
        requests: &[SelectionRequest<'_>],
        inflight: &InflightLoad,
        now: DateTime<Utc>,
    ) -> SchedulerResult<BatchAssignment> {
        if !snapshot.is_bootstrapped() {
            return Err(SchedulerError::SelectorNotInitialized(
                "no catalog snapshot has been published".into(),
            ));
        }

        let filtered: Vec<_> = requests
            .iter()
            .map(|request| self.filter(snapshot, request, inflight, now))
            .collect();

        // Columns: every slot of every resource feasible for some task.
        let mut slots_of: FxHashMap<&ResourceId, u32> = FxHashMap::default();
        let mut resources: Vec<&QuantumResource> = Vec::new();
        for (feasible, _) in &filtered {
            for c in feasible {
                if !slots_of.contains_key(&c.resource.id) {
                    let headroom = c.resource.headroom(inflight.get(&c.resource.id));
                    let slots = headroom.min(u32::try_from(requests.len()).unwrap_or(u32::MAX));
                    slots_of.insert(&c.resource.id, slots);
                    resources.push(c.resource);
                }
            }
        }
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        let mut columns: Vec<(&QuantumResource, u32)> = Vec::new();
        for resource in &resources {
            let slots = slots_of.get(&resource.id).copied().unwrap_or(0);
            columns.extend((0..slots).map(|k| (*resource, k)));
        }

        let mut scores = ScoreMatrix::new(requests.len(), columns.len());
        for (row, (request, (feasible, _))) in requests.iter().zip(&filtered).enumerate() {
            let scorer = self.scorer(request.mode);
            let norm = Normalizer::over(&feasible_with_batch_load(feasible, requests.len()));
            for (col, (resource, k)) in columns.iter().enumerate() {
                if let Some(c) = feasible.iter().find(|c| c.resource.id == resource.id) {
                    let loaded = Candidate {
                        resource: c.resource,
                        effective_queue: c.effective_queue.saturating_add(*k),
                    };
                    scores.set(row, col, scorer.score(&loaded, &norm));
                }
            }
        }

        let matcher = self.matcher(scores.rows() * scores.cols());
        let picked = matcher.assign(&scores);
        let approximate = !matcher.is_exact();

        let assignments = requests
            .iter()
            .zip(filtered.iter())
            .zip(picked)
            .enumerate()
            .map(|(row, ((request, (feasible, report)), col))| {
                let correlation_id = request.descriptor.correlation_id.clone();
                if feasible.is_empty() {
                    return Err(SchedulerError::infeasible(
                        correlation_id,
                        report.reason(request.descriptor),
                    ));
                }
                let (resource, k) = col.map(|c| columns[c]).ok_or_else(|| {
                    SchedulerError::infeasible(
                        correlation_id.clone(),
                        format!(
                            "{} feasible resources but no queue headroom left in this batch",
                            feasible.len()
                        ),
                    )
                })?;
                let effective_queue = feasible
                    .iter()
                    .find(|c| c.resource.id == resource.id)
                    .map_or(resource.queue_depth, |c| c.effective_queue)
                    .saturating_add(k);
                Ok(Selection {
                    resource: resource.clone(),
                    score: col.and_then(|c| scores.get(row, c)).unwrap_or_default(),
                    mode: request.mode,
                    feasible: feasible.len(),
                    effective_queue,
                    phases: vec![
                        SelectionPhase::Init,
                        SelectionPhase::Filtering,
                        SelectionPhase::Scoring,
                        SelectionPhase::Assigned,
                    ],
                })
            })
            .collect();

        let batch = BatchAssignment {
            assignments,
            approximate,
        };
        debug!(
            tasks = requests.len(),
            slots = columns.len(),
            assigned = batch.assigned(),
            approximate,
            "Batch matched"
        );
        Ok(batch)
    }
}

/// The feasible set with each queue stretched by the largest possible batch
/// load, so normalization covers every slot score.
fn feasible_with_batch_load<'a>(feasible: &[Candidate<'a>], batch: usize) -> Vec<Candidate<'a>> {
    let extra = u32::try_from(batch.saturating_sub(1)).unwrap_or(u32::MAX);
    feasible
        .iter()
        .map(|c| Candidate {
            resource: c.resource,
            effective_queue: c.effective_queue.saturating_add(extra),
        })
        .collect()
}
