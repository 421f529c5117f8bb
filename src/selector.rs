use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::ModelDescriptor;

/// How the selector walks its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Advance an index modulo the pool; no repeats within a cycle.
    #[default]
    RoundRobin,
    /// Insertion order, each descriptor served at most once.
    Priority,
    /// Lowest cost weight first; ties break by insertion order.
    CostAware,
    /// Uniform pick, never the same descriptor twice in a row.
    Random,
}

#[derive(Debug, Default)]
struct SelectorState {
    index: usize,
    served: HashSet<String>,
    disabled: HashSet<String>,
    last: Option<String>,
    using_fallback: bool,
}

/// Picks the next descriptor from the healthy pool. Holds a primary and
/// a fallback pool; the scheduler (not the selector) decides when an
/// exhausted primary should switch over.
pub struct ModelSelector {
    strategy: SelectionStrategy,
    primary: Vec<ModelDescriptor>,
    fallback: Vec<ModelDescriptor>,
    state: Mutex<SelectorState>,
}

impl ModelSelector {
    pub fn new(strategy: SelectionStrategy, primary: Vec<ModelDescriptor>) -> Self {
        Self {
            strategy,
            primary,
            fallback: Vec::new(),
            state: Mutex::new(SelectorState::default()),
        }
    }

    pub fn with_fallback(mut self, fallback: Vec<ModelDescriptor>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Next descriptor, or `None` when the active pool is exhausted
    /// (every candidate disabled, or served once under `Priority`).
    pub fn get_next(&self) -> Option<ModelDescriptor> {
        let mut state = self.state.lock().expect("selector lock poisoned");
        let pool: &[ModelDescriptor] = if state.using_fallback {
            &self.fallback
        } else {
            &self.primary
        };

        let candidate_at = |i: usize, state: &SelectorState| -> bool {
            let d = &pool[i];
            d.enabled && !state.disabled.contains(&d.name)
        };

        let picked: Option<usize> = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let n = pool.len();
                (0..n)
                    .map(|step| (state.index + step) % n.max(1))
                    .find(|&i| candidate_at(i, &state))
            }
            SelectionStrategy::Priority => (0..pool.len())
                .find(|&i| candidate_at(i, &state) && !state.served.contains(&pool[i].name)),
            SelectionStrategy::CostAware => (0..pool.len())
                .filter(|&i| candidate_at(i, &state))
                .min_by(|&a, &b| {
                    let wa = pool[a].cost_weight.unwrap_or(f64::MAX);
                    let wb = pool[b].cost_weight.unwrap_or(f64::MAX);
                    wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
                }),
            SelectionStrategy::Random => {
                let candidates: Vec<usize> =
                    (0..pool.len()).filter(|&i| candidate_at(i, &state)).collect();
                match candidates.len() {
                    0 => None,
                    1 => Some(candidates[0]),
                    _ => {
                        // Re-roll once if we landed on the previous pick;
                        // with >1 candidates a repeat is always avoidable.
                        let eligible: Vec<usize> = candidates
                            .iter()
                            .copied()
                            .filter(|&i| state.last.as_deref() != Some(pool[i].name.as_str()))
                            .collect();
                        let from = if eligible.is_empty() { &candidates } else { &eligible };
                        Some(from[rand::thread_rng().gen_range(0..from.len())])
                    }
                }
            }
        };

        picked.map(|i| {
            let d = &pool[i];
            state.index = (i + 1) % pool.len().max(1);
            state.served.insert(d.name.clone());
            state.last = Some(d.name.clone());
            d.clone()
        })
    }

    /// Remove a descriptor from selection for the remainder of this
    /// loop. Used after quota-exhausted classifications; `reset`
    /// clears it.
    pub fn disable(&self, name: &str) {
        let mut state = self.state.lock().expect("selector lock poisoned");
        state.disabled.insert(name.to_string());
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("selector lock poisoned")
            .disabled
            .contains(name)
    }

    /// Move selection to the fallback pool. Returns false when there is
    /// no fallback to switch to.
    pub fn switch_to_fallback(&self) -> bool {
        if self.fallback.is_empty() {
            return false;
        }
        let mut state = self.state.lock().expect("selector lock poisoned");
        if !state.using_fallback {
            state.using_fallback = true;
            state.index = 0;
            state.served.clear();
            state.last = None;
        }
        true
    }

    /// Return selection to the primary pool (keeps disables).
    pub fn reset_to_primary(&self) {
        let mut state = self.state.lock().expect("selector lock poisoned");
        state.using_fallback = false;
        state.index = 0;
        state.served.clear();
        state.last = None;
    }

    pub fn is_using_fallback(&self) -> bool {
        self.state
            .lock()
            .expect("selector lock poisoned")
            .using_fallback
    }

    /// Primary then fallback, as configured.
    pub fn all_models(&self) -> Vec<ModelDescriptor> {
        self.primary
            .iter()
            .chain(self.fallback.iter())
            .cloned()
            .collect()
    }

    /// Back to a fresh primary cycle: clears disables, serve history,
    /// and the fallback switch.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("selector lock poisoned");
        *state = SelectorState::default();
    }
}
