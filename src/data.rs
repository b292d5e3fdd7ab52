use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;

// column names follow the FastF1 lap export
#[derive(Debug, Deserialize)]
struct RawLapRecord {
    #[serde(rename = "Driver")] driver: String,
    #[serde(rename = "LapNumber")] lap_number: f64,
    #[serde(rename = "LapTime")] lap_time: Option<f64>,
    #[serde(rename = "Compound", default)] compound: Option<String>,
    #[serde(rename = "PitOutTime", default)] pit_out_time: Option<String>,
    #[serde(rename = "TrackStatus", default)] track_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPitEvent {
    #[serde(rename = "Driver")] driver: String,
    #[serde(rename = "LapNumber")] lap_number: f64,
    #[serde(rename = "PitLoss", default)] pit_loss: Option<f64>,
}

/// One timed lap of one competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    pub competitor: String,
    pub lap_number: u32,
    pub lap_time: f64,
    pub compound: Option<String>,
    pub pit_out: bool,
    pub track_status: Option<String>,
}

impl LapRecord {
    pub fn new(competitor: impl Into<String>, lap_number: u32, lap_time: f64) -> Self {
        Self {
            competitor: competitor.into(),
            lap_number,
            lap_time,
            compound: None,
            pit_out: false,
            track_status: None,
        }
    }

    pub fn with_compound(mut self, compound: &str) -> Self {
        self.compound = Some(compound.trim().to_uppercase());
        self
    }

    pub fn with_pit_out(mut self) -> Self {
        self.pit_out = true;
        self
    }

    pub fn with_track_status(mut self, status: &str) -> Self {
        self.track_status = Some(status.to_string());
        self
    }
}

/// A recorded tyre change. `lap_number` is the lap driven on the new set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitEvent {
    pub competitor: String,
    pub lap_number: u32,
    /// Measured total time lost to the stop, when the source provides it.
    pub time_loss: Option<f64>,
}

impl PitEvent {
    pub fn new(competitor: impl Into<String>, lap_number: u32) -> Self {
        Self {
            competitor: competitor.into(),
            lap_number,
            time_loss: None,
        }
    }

    pub fn with_time_loss(mut self, seconds: f64) -> Self {
        self.time_loss = Some(seconds);
        self
    }
}

fn is_usable_lap_time(t: f64) -> bool {
    t.is_finite() && t > 0.0
}

/// Reads a lap export. Rows without a usable lap time or competitor are
/// skipped, everything else is kept in file order.
pub fn load_laps<P: AsRef<Path>>(path: P) -> Result<Vec<LapRecord>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut laps = Vec::new();
    let mut skipped = 0usize;

    for res in reader.deserialize() {
        let raw: RawLapRecord = res?;
        let lap_time = raw.lap_time.filter(|t| is_usable_lap_time(*t));
        match lap_time {
            Some(lap_time) if !raw.driver.trim().is_empty() && raw.lap_number >= 1.0 => {
                laps.push(LapRecord {
                    competitor: raw.driver.trim().to_string(),
                    lap_number: raw.lap_number.round() as u32,
                    lap_time,
                    compound: raw
                        .compound
                        .map(|c| c.trim().to_uppercase())
                        .filter(|c| !c.is_empty()),
                    pit_out: raw.pit_out_time.is_some_and(|s| !s.trim().is_empty()),
                    track_status: raw.track_status.filter(|s| !s.trim().is_empty()),
                });
            }
            _ => skipped += 1,
        }
    }

    info!(path = %path.display(), laps = laps.len(), skipped, "loaded lap records");
    Ok(laps)
}

pub fn load_pit_events<P: AsRef<Path>>(path: P) -> Result<Vec<PitEvent>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut events = Vec::new();

    for res in reader.deserialize() {
        let raw: RawPitEvent = res?;
        if raw.driver.trim().is_empty() || raw.lap_number < 1.0 {
            debug!(?raw, "skipping malformed pit row");
            continue;
        }
        events.push(PitEvent {
            competitor: raw.driver.trim().to_string(),
            lap_number: raw.lap_number.round() as u32,
            time_loss: raw.pit_loss.filter(|t| t.is_finite()),
        });
    }

    info!(path = %path.display(), events = events.len(), "loaded pit events");
    Ok(events)
}

/// Anything keyed by competitor and lap number.
pub trait CompetitorLap {
    fn competitor(&self) -> &str;
    fn lap_number(&self) -> u32;
}

impl CompetitorLap for LapRecord {
    fn competitor(&self) -> &str {
        &self.competitor
    }

    fn lap_number(&self) -> u32 {
        self.lap_number
    }
}

/// Indices of each competitor's records, sorted by lap number. The source
/// data is lap-ordered across the whole field, so it is regrouped here.
pub fn group_by_competitor<T: CompetitorLap>(records: &[T]) -> BTreeMap<&str, Vec<usize>> {
    let mut grouped: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        grouped.entry(record.competitor()).or_default().push(idx);
    }
    for indices in grouped.values_mut() {
        indices.sort_by_key(|&i| records[i].lap_number());
    }
    grouped
}
