//! Causal ("why") and counterfactual ("why not") explanations over the
//! execution history.
//!
//! Both traversals are lazy iterators driven by explicit stacks. A shared
//! visited set keeps cyclic causal graphs finite and `max_depth` bounds how
//! far a single explanation reaches.

use std::{collections::HashSet, fmt, sync::Arc};

use crate::{
    clock::Timestamp,
    config::ExplainerSettings,
    entity::EntityId,
    error::{EngineError, EngineResult, HistoryError},
    history::{ExecutionHistory, HistoryFilter, State},
    registry::CausalModel,
};

const DEFAULT_MAX_DEPTH: usize = 64;

/// Explanation generator over one history and one causal model.
#[derive(Clone)]
pub struct Explainer {
    history: Arc<dyn ExecutionHistory>,
    model: Arc<dyn CausalModel>,
    max_depth: usize,
}

impl fmt::Debug for Explainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Explainer")
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

impl Explainer {
    /// Creates an explainer with the default depth bound.
    #[must_use]
    pub fn new(history: Arc<dyn ExecutionHistory>, model: Arc<dyn CausalModel>) -> Self {
        Self {
            history,
            model,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Applies the `[explainer]` section.
    #[must_use]
    pub fn with_settings(self, settings: &ExplainerSettings) -> Self {
        self.with_max_depth(settings.max_depth)
    }

    /// Deepest level either traversal reaches. Clamped to at least 1.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Current depth bound.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Why did `effect` happen? Yields `(cause, depth)` depth-first, each
    /// cause before its own causes, starting at depth 1.
    ///
    /// The visited set spans the whole trace: an origin shared by two
    /// branches appears once, under whichever branch reaches it first.
    #[must_use]
    pub fn x_history(&self, effect: &State) -> CausalTrace<'_> {
        let mut visited = HashSet::new();
        visited.insert(effect.from_id);
        CausalTrace {
            explainer: self,
            stack: Vec::new(),
            visited,
            pending: Some((effect.clone(), 0)),
            failed: false,
        }
    }

    /// Why did something else not happen instead of `effect`? Yields
    /// `(event, score, depth)` in post-order; unrealized causes appear as
    /// hypothetical events.
    #[must_use]
    pub fn x_not(&self, effect: &State) -> CounterfactualTrace<'_> {
        CounterfactualTrace {
            explainer: self,
            frames: Vec::new(),
            visited: HashSet::new(),
            root: Some(effect.clone()),
            failed: false,
        }
    }

    /// Collects [`Explainer::x_history`] on the blocking pool.
    pub async fn x_history_async(&self, effect: State) -> EngineResult<Vec<(State, usize)>> {
        let explainer = self.clone();
        let trace = tokio::task::spawn_blocking(move || {
            explainer
                .x_history(&effect)
                .collect::<Result<Vec<_>, HistoryError>>()
        })
        .await
        .map_err(|err| EngineError::Runtime(err.to_string()))?;
        Ok(trace?)
    }

    /// Collects [`Explainer::x_not`] on the blocking pool.
    pub async fn x_not_async(&self, effect: State) -> EngineResult<Vec<(State, f64, usize)>> {
        let explainer = self.clone();
        let trace = tokio::task::spawn_blocking(move || {
            explainer
                .x_not(&effect)
                .collect::<Result<Vec<_>, HistoryError>>()
        })
        .await
        .map_err(|err| EngineError::Runtime(err.to_string()))?;
        Ok(trace?)
    }

    /// Most recent event from `cause` aimed at `effect.from_id` (or at
    /// nothing) that completed inside the window.
    fn latest_cause(
        &self,
        cause: EntityId,
        effect: &State,
        since: Option<Timestamp>,
    ) -> Result<Option<State>, HistoryError> {
        let mut filter = HistoryFilter::new()
            .from_id(cause)
            .to_ids([Some(effect.from_id), None])
            .max_time(effect.activation_time);
        if let Some(since) = since {
            filter = filter.min_time(since);
        }
        self.history.latest(filter)
    }
}

/// Lazy causal explanation returned by [`Explainer::x_history`].
pub struct CausalTrace<'a> {
    explainer: &'a Explainer,
    stack: Vec<(State, usize)>,
    visited: HashSet<EntityId>,
    pending: Option<(State, usize)>,
    failed: bool,
}

impl CausalTrace<'_> {
    fn expand(&mut self, effect: &State, depth: usize) -> Result<(), HistoryError> {
        let mut causes = Vec::new();
        for cause in self.explainer.model.predecessors(effect.from_id) {
            if self.visited.contains(&cause) {
                continue;
            }
            if let Some(found) = self.explainer.latest_cause(cause, effect, None)? {
                causes.push(found);
            }
        }
        causes.sort_by(State::newest_first);
        self.stack
            .extend(causes.into_iter().rev().map(|cause| (cause, depth + 1)));
        Ok(())
    }
}

impl Iterator for CausalTrace<'_> {
    type Item = Result<(State, usize), HistoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some((effect, depth)) = self.pending.take() {
            if let Err(err) = self.expand(&effect, depth) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        loop {
            let (state, depth) = self.stack.pop()?;
            // Another branch may have reached the same origin meanwhile.
            if !self.visited.insert(state.from_id) {
                continue;
            }
            if depth < self.explainer.max_depth {
                self.pending = Some((state.clone(), depth));
            }
            return Some(Ok((state, depth)));
        }
    }
}

struct Frame {
    state: State,
    depth: usize,
    score: f64,
    unexplored: Vec<EntityId>,
}

/// Lazy counterfactual explanation returned by [`Explainer::x_not`].
pub struct CounterfactualTrace<'a> {
    explainer: &'a Explainer,
    frames: Vec<Frame>,
    visited: HashSet<EntityId>,
    root: Option<State>,
    failed: bool,
}

impl CounterfactualTrace<'_> {
    /// Scores `state` and pushes its frame unless its origin was already seen.
    fn open(&mut self, state: State, depth: usize) -> Result<(), HistoryError> {
        if !self.visited.insert(state.from_id) {
            return Ok(());
        }
        let history = &self.explainer.history;
        // Only causes newer than the previous event aimed at the same target count.
        let since = history
            .latest(
                HistoryFilter::new()
                    .to_ids([state.to_id])
                    .max_activation_time(state.activation_time - 1),
            )?
            .map(|previous| previous.activation_time + 1);

        let possible = self.explainer.model.predecessors(state.from_id);
        let mut realized = 0_u32;
        let mut unexplored = Vec::new();
        for &cause in &possible {
            if self.explainer.latest_cause(cause, &state, since)?.is_some() {
                realized += 1;
            } else {
                unexplored.push(cause);
            }
        }
        let possible = u32::try_from(possible.len()).unwrap_or(u32::MAX);
        let depth_weight = 1.0 / f64::from(u32::try_from(depth).unwrap_or(u32::MAX));
        let score = depth_weight * (f64::from(realized) / (f64::from(possible) + 1.0));
        unexplored.reverse();
        self.frames.push(Frame {
            state,
            depth,
            score,
            unexplored,
        });
        Ok(())
    }
}

impl Iterator for CounterfactualTrace<'_> {
    type Item = Result<(State, f64, usize), HistoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(root) = self.root.take() {
            if let Err(err) = self.open(root, 1) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        loop {
            let frame = self.frames.last_mut()?;
            if frame.depth < self.explainer.max_depth {
                if let Some(cause) = frame.unexplored.pop() {
                    let hypothetical = State::hypothetical(
                        cause,
                        Some(frame.state.from_id),
                        frame.state.activation_time,
                    );
                    let depth = frame.depth + 1;
                    if let Err(err) = self.open(hypothetical, depth) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    continue;
                }
            }
            let done = self.frames.pop()?;
            if let Some(parent) = self.frames.last_mut() {
                parent.score += done.score;
            }
            return Some(Ok((done.state, done.score, done.depth)));
        }
    }
}
