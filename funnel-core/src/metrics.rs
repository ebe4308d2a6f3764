use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::evaluator::VisitOutcome;

/// Counters for one step of one funnel. All fields are additive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepMetrics {
    pub visits: u64,
    pub entries: u64,
    pub exits: u64,
    pub proceeded: u64,
    pub skips: u64,
    // Seconds, summed over accepted transitions out of this step
    pub time_spent: u64,
    pub time_hits: u64,
    #[serde(default)]
    pub dropoff_urls: BTreeMap<String, u64>,
}

impl StepMetrics {
    pub fn merge(&mut self, other: &StepMetrics) {
        self.visits += other.visits;
        self.entries += other.entries;
        self.exits += other.exits;
        self.proceeded += other.proceeded;
        self.skips += other.skips;
        self.time_spent += other.time_spent;
        self.time_hits += other.time_hits;
        merge_counts(&mut self.dropoff_urls, &other.dropoff_urls);
    }
}

/// Sums `other` into `into` key by key; absent keys start at zero.
pub fn merge_counts(into: &mut BTreeMap<String, u64>, other: &BTreeMap<String, u64>) {
    for (key, count) in other {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

/// Running per-step totals for one funnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunnelMetrics {
    pub funnel_id: i64,
    pub steps: Vec<StepMetrics>,
}

impl FunnelMetrics {
    pub fn new(funnel_id: i64, step_count: usize) -> Self {
        Self {
            funnel_id,
            steps: vec![StepMetrics::default(); step_count],
        }
    }

    fn step_mut(&mut self, index: usize) -> &mut StepMetrics {
        if index >= self.steps.len() {
            self.steps.resize_with(index + 1, StepMetrics::default);
        }
        &mut self.steps[index]
    }

    /// Folds one visit's outcome into the totals.
    pub fn record(&mut self, outcome: &VisitOutcome) {
        let Some(entry) = outcome.entry else {
            return;
        };

        let step = self.step_mut(entry);
        step.entries += 1;
        step.visits += 1;

        for &skipped in &outcome.skipped {
            self.step_mut(skipped).skips += 1;
        }

        for transition in &outcome.transitions {
            let from = self.step_mut(transition.from);
            from.proceeded += 1;
            if let Some(seconds) = transition.seconds {
                from.time_spent += seconds;
                from.time_hits += 1;
            }
            self.step_mut(transition.to).visits += 1;
        }

        if let Some(exit) = &outcome.exit {
            let step = self.step_mut(exit.step);
            step.exits += 1;
            if let Some(url) = &exit.next_url {
                *step.dropoff_urls.entry(url.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Adds another accumulator for the same funnel, step by step.
    pub fn merge(&mut self, other: &FunnelMetrics) {
        for (index, step) in other.steps.iter().enumerate() {
            self.step_mut(index).merge(step);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|step| *step == StepMetrics::default())
    }
}
