//! Undercut probability: tyre-age derivation, degradation / outlap / pit-loss
//! models with scoped parameters, and a seeded Monte Carlo simulator.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod outlap;
pub mod params;
pub mod pit_loss;
pub mod scope;
pub mod simulation;
pub mod stats;
pub mod store;
pub mod training;
pub mod tyre_age;

pub use config::Settings;
pub use data::{LapRecord, PitEvent};
pub use error::{Result, UndercutError};
pub use model::{DegradationModel, DegradationSample};
pub use outlap::OutlapModel;
pub use params::{DegradationParameters, OutlapParameters, Parameters, PitLossParameters};
pub use pit_loss::PitLossModel;
pub use scope::{ScopeKey, ScopeLevel};
pub use simulation::{
    ScenarioDistribution, ScopesUsed, SimulationEngine, SimulationRequest, SimulationResult,
};
pub use store::{ParameterStore, Resolved};
pub use training::{Session, TrainingPipeline};
pub use tyre_age::{AgedLap, TireStint, TyreAgeCalculator};
