//! RBMK Spent Fuel Dose-Rate Library
//!
//! Burnup of every fuel assembly segment is accumulated over the core power
//! history from MCU fission shares; the hottest histories are handed to the
//! ORIGEN decay program, and the resulting gamma sources are folded with
//! precomputed Green's functions into handling dose rates around the
//! assembly.

pub mod error;
pub mod table;
pub mod schema;
pub mod fin;
pub mod algorithm;
pub mod green;
pub mod history;
pub mod decay;
pub mod dose;
pub mod output;
pub mod config;
pub mod calculation;

pub use algorithm::{AlgorithmModel, MissingChannelPolicy};
pub use calculation::{DoseCalculation, StaticData};
pub use config::RunConfig;
pub use error::{DoseError, DoseResult};
pub use history::{BurnupEngine, EnginePreset};
