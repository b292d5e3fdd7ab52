use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use undercut::data::{load_laps, load_pit_events};
use undercut::{ParameterStore, Session, Settings, SimulationEngine, TrainingPipeline};

// Usage: undercut [config.toml]
// Trains on the configured session (if any), persists parameters, then runs
// the configured scenario and prints the result as JSON.
fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    let store = match &settings.store.path {
        Some(path) => ParameterStore::open(path, &settings)?,
        None => ParameterStore::new(&settings),
    };

    // Train only when a lap export is configured; otherwise use what the
    // store already holds.
    if let Some(laps_csv) = &settings.data.laps_csv {
        let laps = load_laps(laps_csv)?;
        let pits = match &settings.data.pits_csv {
            Some(path) => load_pit_events(path)?,
            None => Vec::new(),
        };
        if laps.is_empty() {
            return Err("No lap data found.".into());
        }
        let circuit = settings.data.circuit.clone().unwrap_or_else(|| "unknown".to_string());
        let report = TrainingPipeline::new(&settings).train(&[Session { circuit, laps, pits }], &store)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    info!(summary = ?store.summary(), "parameter store ready");

    let Some(request) = settings.scenario.clone() else {
        info!("no scenario configured; nothing to simulate");
        return Ok(());
    };
    let engine = SimulationEngine::new(Arc::new(store));
    let result = engine.simulate(&request)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
