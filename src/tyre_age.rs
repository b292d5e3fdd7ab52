//! Per-lap tyre age derived from raw lap and pit records.
//!
//! Age 1 is the first lap on a set. Age holds (neither increments nor
//! resets) on neutralized laps, and resets to 1 on a pit-out lap.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::TyreAgeSettings;
use crate::data::{group_by_competitor, CompetitorLap, LapRecord, PitEvent};
use crate::stats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgedLap {
    pub lap: LapRecord,
    pub tyre_age: u32,
    pub neutralized: bool,
    /// First lap of a stint: the competitor's first lap or a reset lap.
    pub stint_start: bool,
}

/// A continuous run on one tyre set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TireStint {
    pub competitor: String,
    pub start_lap: u32,
    pub compound: Option<String>,
    /// False for the set a competitor started the session on.
    pub from_pit: bool,
    pub laps: Vec<AgedLap>,
}

impl CompetitorLap for AgedLap {
    fn competitor(&self) -> &str {
        &self.lap.competitor
    }

    fn lap_number(&self) -> u32 {
        self.lap.lap_number
    }
}

impl TireStint {
    pub fn ages(&self) -> Vec<u32> {
        self.laps.iter().map(|l| l.tyre_age).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TyreAgeCalculator {
    settings: TyreAgeSettings,
}

impl TyreAgeCalculator {
    pub fn new(settings: TyreAgeSettings) -> Self {
        Self { settings }
    }

    /// Returns every input lap, in input order, augmented with its tyre age.
    pub fn compute_tyre_age(&self, laps: &[LapRecord], pits: &[PitEvent]) -> Vec<AgedLap> {
        if laps.is_empty() {
            return Vec::new();
        }

        // A set per competitor collapses double stops on the same lap into a
        // single reset.
        let mut pit_laps: HashMap<&str, BTreeSet<u32>> = HashMap::new();
        for pit in pits {
            pit_laps.entry(pit.competitor.as_str()).or_default().insert(pit.lap_number);
        }

        let lap_times: Vec<f64> = laps.iter().map(|l| l.lap_time).collect();
        let slow_threshold = stats::median(&lap_times)
            .map(|typical| typical * self.settings.neutral_pace_multiplier);

        let mut out: Vec<Option<AgedLap>> = vec![None; laps.len()];
        for (competitor, indices) in group_by_competitor(laps) {
            let stops = pit_laps.get(competitor);

            let mut age = 1u32;
            let mut resets = 0usize;
            let mut prev_lap: Option<u32> = None;
            for &idx in &indices {
                let lap = &laps[idx];
                let neutralized = self.is_neutralized(lap, slow_threshold);
                // A stop whose own lap is missing from the data still resets
                // the next lap that is present.
                let pitted_since_prev = match (stops, prev_lap) {
                    (Some(stops), Some(prev)) if prev < lap.lap_number => {
                        stops.range(prev + 1..=lap.lap_number).next().is_some()
                    }
                    _ => false,
                };
                let reset = lap.pit_out || pitted_since_prev;

                let stint_start = if prev_lap.is_none() {
                    age = 1;
                    true
                } else if reset {
                    age = 1;
                    resets += 1;
                    true
                } else {
                    if !neutralized {
                        age += 1;
                    }
                    false
                };
                prev_lap = Some(lap.lap_number);

                out[idx] = Some(AgedLap {
                    lap: lap.clone(),
                    tyre_age: age,
                    neutralized,
                    stint_start,
                });
            }
            debug!(competitor, laps = indices.len(), resets, "computed tyre ages");
        }

        out.into_iter().flatten().collect()
    }

    fn is_neutralized(&self, lap: &LapRecord, slow_threshold: Option<f64>) -> bool {
        let flagged = lap.track_status.as_deref().is_some_and(|status| {
            let status = status.trim();
            self.settings
                .neutral_status_codes
                .iter()
                .any(|code| code.eq_ignore_ascii_case(status))
        });
        flagged || slow_threshold.is_some_and(|limit| lap.lap_time > limit)
    }
}

/// Splits aged laps into stints, per competitor, at every stint start.
pub fn stints(aged: &[AgedLap]) -> Vec<TireStint> {
    let mut result = Vec::new();
    for (competitor, indices) in group_by_competitor(aged) {
        let mut current: Option<TireStint> = None;

        for lap in indices.iter().map(|&i| &aged[i]) {
            if lap.stint_start || current.is_none() {
                let from_pit = current.is_some();
                if let Some(done) = current.take() {
                    result.push(done);
                }
                current = Some(TireStint {
                    competitor: competitor.to_string(),
                    start_lap: lap.lap.lap_number,
                    compound: None,
                    from_pit,
                    laps: Vec::new(),
                });
            }
            if let Some(stint) = current.as_mut() {
                if stint.compound.is_none() {
                    stint.compound = lap.lap.compound.clone();
                }
                stint.laps.push(lap.clone());
            }
        }
        if let Some(done) = current {
            result.push(done);
        }
    }
    result
}
