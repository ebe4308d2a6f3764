use chrono::{DateTime, Utc};

use crate::hit::{Hit, Visit};
use crate::matching::CompiledFunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunnelState {
    #[default]
    NotEntered,
    AtStep(usize),
    // Reached the last step
    Done,
}

/// An accepted move from one step to a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    // None when either hit had no usable timestamp
    pub seconds: Option<u64>,
}

/// Where a visit stopped short of the last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub step: usize,
    // URL of the hit right after the one that entered `step`, if it had one
    pub next_url: Option<String>,
}

/// What a single visit contributed to one funnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitOutcome {
    pub entry: Option<usize>,
    pub transitions: Vec<Transition>,
    pub skipped: Vec<usize>,
    pub exit: Option<Exit>,
    pub state: FunnelState,
}

impl VisitOutcome {
    /// Step indexes the visit was counted at, in order.
    pub fn visited_steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.entry
            .into_iter()
            .chain(self.transitions.iter().map(|t| t.to))
    }
}

// Per-visit cursor state, kept apart from the outcome being built
struct Cursor {
    state: FunnelState,
    // Index of the hit that moved the visit into its current step
    anchor: usize,
    anchor_time: Option<DateTime<Utc>>,
    // A page view happened since the anchor hit without moving the visit on
    interrupted: bool,
}

impl Cursor {
    fn enter(&mut self, step: usize, last: usize, index: usize, hit: &Hit) {
        self.state = if step == last {
            FunnelState::Done
        } else {
            FunnelState::AtStep(step)
        };
        self.anchor = index;
        self.anchor_time = hit.timestamp;
        self.interrupted = false;
    }
}

/// Runs one visit through one funnel.
///
/// Hits are scanned in order. Until the visit enters the funnel each hit is
/// tested against the steps from the first one on; afterwards only steps
/// after the current one are considered, so a visit never moves backwards.
/// In both cases an unmatched required step ends the scan, and steps crossed
/// on the way are reported as skipped. A move is rejected when the funnel is
/// strict and a page view happened since the current step was entered, or
/// when it took longer than the funnel's step time limit.
///
/// Goal-linked funnels only see visits that converted the goal. A visit
/// whose conversions were not loaded is excluded rather than assumed to
/// have converted.
pub fn evaluate(funnel: &CompiledFunnel, visit: &Visit) -> VisitOutcome {
    let mut outcome = VisitOutcome::default();

    if funnel.is_empty() {
        return outcome;
    }

    if let Some(goal_id) = funnel.definition().goal_id {
        if visit.converted(goal_id) != Some(true) {
            return outcome;
        }
    }

    let definition = funnel.definition();
    let last = funnel.step_count() - 1;
    let mut cursor = Cursor {
        state: FunnelState::NotEntered,
        anchor: 0,
        anchor_time: None,
        interrupted: false,
    };

    for (index, hit) in visit.hits.iter().enumerate() {
        match cursor.state {
            FunnelState::Done => break,
            FunnelState::NotEntered => {
                if let Some(step) = funnel.first_match(0, hit) {
                    outcome.entry = Some(step);
                    outcome.skipped.extend(0..step);
                    cursor.enter(step, last, index, hit);
                }
            }
            FunnelState::AtStep(current) => {
                let candidate = funnel.first_match(current + 1, hit);
                let seconds = elapsed_seconds(cursor.anchor_time, hit.timestamp);

                let accepted = candidate.filter(|_| {
                    if definition.strict_mode && cursor.interrupted {
                        return false;
                    }
                    // Without timestamps the limit can't be checked; the move
                    // is kept but earns no time
                    match (definition.step_time_limit(), seconds) {
                        (Some(limit), Some(seconds)) => seconds <= limit,
                        _ => true,
                    }
                });

                match accepted {
                    Some(next) => {
                        outcome.transitions.push(Transition {
                            from: current,
                            to: next,
                            seconds,
                        });
                        outcome.skipped.extend(current + 1..next);
                        cursor.enter(next, last, index, hit);
                    }
                    None => {
                        if hit.page_url().is_some() {
                            cursor.interrupted = true;
                        }
                    }
                }
            }
        }
    }

    if let FunnelState::AtStep(step) = cursor.state {
        let next_url = visit
            .hits
            .get(cursor.anchor + 1)
            .and_then(Hit::page_url)
            .map(str::to_string);
        outcome.exit = Some(Exit { step, next_url });
    }

    outcome.state = cursor.state;
    outcome
}

fn elapsed_seconds(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<u64> {
    let (from, to) = (from?, to?);
    // Hits arrive ordered by time, a negative gap can only be a tie
    Some((to - from).num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Condition, Field, FunnelDefinition, Operator, StepDefinition};
    use chrono::{Duration, TimeZone};

    fn step(path: &str) -> StepDefinition {
        StepDefinition::new(
            path,
            vec![Condition::new(Field::Url, Operator::Contains, path)],
        )
    }

    fn compile(steps: Vec<StepDefinition>) -> CompiledFunnel {
        CompiledFunnel::compile(FunnelDefinition::new(1, 1, steps))
    }

    fn three_steps() -> CompiledFunnel {
        compile(vec![step("/step1"), step("/step2"), step("/step3")])
    }

    fn visit(urls: &[&str]) -> Visit {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let hits = urls
            .iter()
            .enumerate()
            .map(|(i, url)| Hit::page_view(*url).at(start + Duration::seconds(10 * i as i64)))
            .collect();
        Visit::new(1, hits)
    }

    #[test]
    fn full_completion() {
        let outcome = evaluate(
            &three_steps(),
            &visit(&["/home", "/step1", "/step2", "/step3", "/thanks"]),
        );

        assert_eq!(outcome.entry, Some(0));
        assert_eq!(
            outcome.transitions,
            vec![
                Transition { from: 0, to: 1, seconds: Some(10) },
                Transition { from: 1, to: 2, seconds: Some(10) },
            ]
        );
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.exit, None);
        assert_eq!(outcome.state, FunnelState::Done);
        assert_eq!(outcome.visited_steps().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn never_entering_contributes_nothing() {
        let outcome = evaluate(&three_steps(), &visit(&["/home", "/about"]));
        assert_eq!(outcome, VisitOutcome::default());
    }

    #[test]
    fn drop_off_records_following_url() {
        let outcome = evaluate(&three_steps(), &visit(&["/step1", "/other", "/more"]));

        assert_eq!(
            outcome.exit,
            Some(Exit { step: 0, next_url: Some("/other".to_string()) })
        );
        assert_eq!(outcome.state, FunnelState::AtStep(0));
    }

    #[test]
    fn drop_off_without_following_hit() {
        let outcome = evaluate(&three_steps(), &visit(&["/home", "/step1"]));
        assert_eq!(outcome.exit, Some(Exit { step: 0, next_url: None }));
    }

    #[test]
    fn drop_off_following_hit_without_url() {
        let mut visit = visit(&["/step1"]);
        visit.hits.push(Hit::event("video", "play"));

        let outcome = evaluate(&three_steps(), &visit);
        assert_eq!(outcome.exit, Some(Exit { step: 0, next_url: None }));
    }

    #[test]
    fn drop_off_uses_hit_after_current_step_entry() {
        let outcome = evaluate(
            &three_steps(),
            &visit(&["/step1", "/a", "/step2", "/b", "/c"]),
        );
        assert_eq!(
            outcome.exit,
            Some(Exit { step: 1, next_url: Some("/b".to_string()) })
        );
    }

    #[test]
    fn direct_entry_skips_earlier_steps() {
        let outcome = evaluate(&three_steps(), &visit(&["/step2", "/step3"]));

        assert_eq!(outcome.entry, Some(1));
        assert_eq!(outcome.skipped, vec![0]);
        assert_eq!(outcome.state, FunnelState::Done);
    }

    #[test]
    fn optional_step_can_be_crossed_while_progressing() {
        let outcome = evaluate(&three_steps(), &visit(&["/step1", "/step3"]));

        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].from, 0);
        assert_eq!(outcome.transitions[0].to, 2);
        assert_eq!(outcome.skipped, vec![1]);
    }

    #[test]
    fn required_step_is_a_barrier_for_entry() {
        let funnel = compile(vec![step("/step1").required(), step("/step2"), step("/step3")]);
        let outcome = evaluate(&funnel, &visit(&["/step2", "/step3"]));

        assert_eq!(outcome, VisitOutcome::default());
    }

    #[test]
    fn required_step_is_a_barrier_for_progression() {
        let funnel = compile(vec![step("/step1"), step("/step2").required(), step("/step3")]);
        let outcome = evaluate(&funnel, &visit(&["/step1", "/step3", "/step2", "/step3"]));

        assert_eq!(
            outcome.visited_steps().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn loopback_progresses_once_per_step() {
        let outcome = evaluate(
            &three_steps(),
            &visit(&["/step1", "/step2", "/step1", "/step2", "/step3"]),
        );

        assert_eq!(outcome.visited_steps().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(outcome.transitions[1].seconds, Some(30));
    }

    #[test]
    fn single_step_funnel_is_done_on_entry() {
        let funnel = compile(vec![step("/step1")]);
        let outcome = evaluate(&funnel, &visit(&["/step1", "/other"]));

        assert_eq!(outcome.entry, Some(0));
        assert_eq!(outcome.exit, None);
        assert_eq!(outcome.state, FunnelState::Done);
    }

    #[test]
    fn empty_funnel_contributes_nothing() {
        let outcome = evaluate(&compile(vec![]), &visit(&["/step1"]));
        assert_eq!(outcome, VisitOutcome::default());
    }

    #[test]
    fn strict_mode_rejects_intervening_page_views() {
        let mut definition = FunnelDefinition::new(1, 1, vec![step("/step1"), step("/step2")]);
        definition.strict_mode = true;
        let funnel = CompiledFunnel::compile(definition);

        let clean = evaluate(&funnel, &visit(&["/step1", "/step2"]));
        assert_eq!(clean.transitions.len(), 1);

        let broken = evaluate(&funnel, &visit(&["/step1", "/other", "/step2"]));
        assert!(broken.transitions.is_empty());
        assert_eq!(broken.exit.map(|e| e.step), Some(0));
    }

    #[test]
    fn strict_mode_allows_hits_without_url() {
        let mut definition = FunnelDefinition::new(1, 1, vec![step("/step1"), step("/step2")]);
        definition.strict_mode = true;
        let funnel = CompiledFunnel::compile(definition);

        let mut visit = visit(&["/step1"]);
        visit.hits.push(Hit::event("video", "play"));
        visit.hits.push(Hit::page_view("/step2"));

        assert_eq!(evaluate(&funnel, &visit).transitions.len(), 1);
    }

    #[test]
    fn time_limit_rejects_slow_transitions() {
        let mut definition = FunnelDefinition::new(1, 1, vec![step("/step1"), step("/step2")]);
        definition.step_time_limit_seconds = 60;
        let funnel = CompiledFunnel::compile(definition);

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let at = |url: &str, seconds: i64| Hit::page_view(url).at(start + Duration::seconds(seconds));

        let fast = Visit::new(1, vec![at("/step1", 0), at("/step2", 60)]);
        assert_eq!(
            evaluate(&funnel, &fast).transitions,
            vec![Transition { from: 0, to: 1, seconds: Some(60) }]
        );

        let slow = Visit::new(2, vec![at("/step1", 0), at("/step2", 61)]);
        assert!(evaluate(&funnel, &slow).transitions.is_empty());
    }

    #[test]
    fn missing_timestamp_keeps_transition_without_time() {
        let mut definition = FunnelDefinition::new(1, 1, vec![step("/step1"), step("/step2")]);
        definition.step_time_limit_seconds = 60;
        let funnel = CompiledFunnel::compile(definition);

        let visit = Visit::new(
            1,
            vec![
                Hit::page_view("/step1"),
                Hit::page_view("/step2").at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            ],
        );

        assert_eq!(
            evaluate(&funnel, &visit).transitions,
            vec![Transition { from: 0, to: 1, seconds: None }]
        );
    }

    #[test]
    fn goal_linked_funnel_requires_conversion() {
        let mut definition = FunnelDefinition::new(1, 1, vec![step("/step1"), step("/step2")]);
        definition.goal_id = Some(4);
        let funnel = CompiledFunnel::compile(definition);
        let base = visit(&["/step1", "/step2"]);

        let converted = base.clone().with_goals([4]);
        assert_eq!(evaluate(&funnel, &converted).entry, Some(0));

        let other_goal = base.clone().with_goals([5]);
        assert_eq!(evaluate(&funnel, &other_goal), VisitOutcome::default());

        // conversions never loaded
        assert_eq!(evaluate(&funnel, &base), VisitOutcome::default());
    }
}
