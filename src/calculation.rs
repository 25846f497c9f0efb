//! Top-level dose-rate calculation
//!
//! Ties the pieces together the way an operator runs them: static data
//! (algorithms and Green's functions) is loaded once, then either the
//! whole-core envelope or a single cell is carried from the power history
//! through the decay program to dose rates on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Local;
use log::info;
use serde::Serialize;

use crate::algorithm::AlgorithmModel;
use crate::config::{constants::*, RunConfig};
use crate::decay::{DecayGrid, SourceSpectrum};
use crate::dose::{to_microsievert_per_hour, DoseRateEngine};
use crate::error::{DoseError, DoseResult};
use crate::fin::{AssemblyZones, DetectorZones};
use crate::green::GreenLibrary;
use crate::history::{append_history_record, time_from_value, BurnupEngine, BurnupSummary, EnginePreset};
use crate::output::write_dose_table;
use crate::schema::{PowerHistoryRecord, TimePoint};
use crate::table::{classify, TypedTable};

/// Decay-program run names of the three reduced histories
pub const DECAY_RUNS: [&str; 3] = ["max_burnup", "max_2_hours", "envelope"];

/// Algorithms and Green's functions, loaded once per run
pub struct StaticData {
    pub model: AlgorithmModel,
    pub greens: GreenLibrary,
}

impl StaticData {
    pub fn load(config: &RunConfig) -> DoseResult<Self> {
        let list = TypedTable::load(config.configs_path(&config.algorithm_list))?;
        info!("Fields: {:?}", list.fields());
        info!("Total {} data records", list.len());

        let assemblies =
            AssemblyZones::from_table(&TypedTable::load(config.configs_path(&config.assembly_zones))?)?;
        let detectors =
            DetectorZones::from_table(&TypedTable::load(config.configs_path(&config.detector_zones))?)?;
        let effectiveness = TypedTable::load(config.configs_path(&config.detector_effectiveness))?;

        let model = AlgorithmModel::load(
            &list,
            &config.fin_path(),
            &assemblies,
            &detectors,
            &effectiveness,
            config.missing_channel_policy,
        )?;

        // upper-half segments reuse the lower-half functions mirrored
        let segments = model.segment_count();
        let greens = GreenLibrary::load(&config.green_path(), segments - segments / 2)?;

        Ok(Self { model, greens })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeReport {
    pub burnup: BurnupSummary,
    pub decay_hours: Vec<f64>,
    /// zone -> dose rate per decay time [uSv/h]
    pub dose_rates: BTreeMap<String, Vec<f64>>,
}

pub struct DoseCalculation<'a> {
    config: &'a RunConfig,
    data: &'a StaticData,
    grid: DecayGrid,
}

impl<'a> DoseCalculation<'a> {
    pub fn new(config: &'a RunConfig, data: &'a StaticData) -> DoseResult<Self> {
        Ok(Self {
            config,
            data,
            grid: DecayGrid::logarithmic(config.decay_hours)?,
        })
    }

    pub fn grid(&self) -> &DecayGrid {
        &self.grid
    }

    fn engine(&self) -> DoseResult<BurnupEngine<'a>> {
        let data: &'a StaticData = self.data;
        BurnupEngine::load(&data.model, self.config.preset, self.config.history_path())
    }

    fn results_dir(&self) -> DoseResult<PathBuf> {
        let dir = self.config.results_path();
        fs::create_dir_all(&dir).map_err(|e| DoseError::io(&dir, e))?;
        Ok(dir)
    }

    /// Whole-core run: burnup, the three decay-program runs and the
    /// envelope dose rates on the assembly surface
    pub fn envelope(&self) -> DoseResult<EnvelopeReport> {
        let engine = self.engine()?;
        let state = engine.run()?;
        let summary = engine.summary(&state)?;

        let results = self.results_dir()?;
        if self.config.write_history_files {
            state.envelope.write_stepped(results.join(ENVELOPE_HISTORY_FILE))?;
            state.max_history.write_stepped(results.join(MAX_HISTORY_FILE))?;
            state.max2_history.write_stepped(results.join(MAX2_HISTORY_FILE))?;
        }

        let program = self.config.decay_program();
        let histories = [&state.max_history, &state.max2_history, &state.envelope];
        let mut spectra: Vec<SourceSpectrum> = Vec::with_capacity(DECAY_RUNS.len());
        for (name, history) in DECAY_RUNS.iter().zip(histories) {
            spectra.push(program.spectrum(name, history, &self.grid)?);
        }
        let envelope_spectrum = &spectra[2];

        let doses = DoseRateEngine::new(&self.data.greens, &self.grid, self.data.model.segment_count())?;
        let axial = state.axial_weights();
        let mut rates = BTreeMap::new();
        for &zone in &self.config.envelope_zones {
            rates.insert(zone, doses.envelope_dose_rate(&axial, zone, envelope_spectrum)?);
        }

        write_dose_table(results.join(ENVELOPE_DOSE_FILE), &self.grid, &rates)?;

        let report = EnvelopeReport {
            burnup: summary,
            decay_hours: self.grid.hours().to_vec(),
            dose_rates: rates
                .iter()
                .map(|(zone, r)| (zone.to_string(), to_microsievert_per_hour(r)))
                .collect(),
        };
        let summary_path = results.join(SUMMARY_FILE);
        fs::write(&summary_path, serde_json::to_string_pretty(&report)?)
            .map_err(|e| DoseError::io(&summary_path, e))?;
        info!("{} saved", summary_path.display());
        Ok(report)
    }

    /// Dose rates around one cell from its own segment histories
    pub fn cell(&self, cell: &str) -> DoseResult<BTreeMap<i64, Vec<f64>>> {
        let engine = self.engine()?;
        let histories = engine.cell_histories(cell)?;

        let program = self.config.decay_program();
        let spectra = histories
            .iter()
            .enumerate()
            .map(|(seg, history)| program.spectrum(&format!("{}_{}", cell, seg), history, &self.grid))
            .collect::<DoseResult<Vec<_>>>()?;

        let doses = DoseRateEngine::new(&self.data.greens, &self.grid, self.data.model.segment_count())?;
        let rates = doses.cell_dose_rates(&spectra, &self.config.cell_zones)?;

        let results = self.results_dir()?;
        write_dose_table(results.join(format!("{}.txt", cell)), &self.grid, &rates)?;
        Ok(rates)
    }
}

/// Resolve the time of a new history snapshot. Real-time logs default to
/// the current local time; test plans need an explicit hour.
pub fn snapshot_time(preset: EnginePreset, time: Option<&str>) -> DoseResult<TimePoint> {
    let parsed = match time {
        Some(token) => {
            let t = classify(token.trim())
                .as_ref()
                .and_then(time_from_value)
                .ok_or_else(|| DoseError::Config(format!("cannot read time {:?}", token)))?;
            Some(t)
        }
        None => None,
    };
    match (preset, parsed) {
        (EnginePreset::Realtime, None) => Ok(TimePoint::Clock(Local::now().naive_local())),
        (EnginePreset::TestPlan, None) => Err(DoseError::Config(
            "test plan snapshots need a time in hours".into(),
        )),
        (EnginePreset::Realtime, Some(t @ TimePoint::Clock(_)))
        | (EnginePreset::TestPlan, Some(t @ TimePoint::Hours(_))) => Ok(t),
        (_, Some(_)) => Err(DoseError::Config(format!(
            "time {:?} does not fit a {:?} history",
            time.unwrap_or_default(),
            preset
        ))),
    }
}

/// Append one core snapshot to the configured history log
pub fn append_snapshot(
    config: &RunConfig,
    time: Option<&str>,
    power: f64,
    algorithm: &str,
    assemblies: u32,
) -> DoseResult<PowerHistoryRecord> {
    let rec = PowerHistoryRecord {
        time: snapshot_time(config.preset, time)?,
        power,
        algorithm: algorithm.to_string(),
        assemblies,
    };
    append_history_record(config.history_path(), &rec)?;
    info!("Snapshot appended to {}", config.history_path().display());
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_time() {
        assert!(matches!(
            snapshot_time(EnginePreset::Realtime, None),
            Ok(TimePoint::Clock(_))
        ));
        assert_eq!(
            snapshot_time(EnginePreset::TestPlan, Some("12.5")).unwrap(),
            TimePoint::Hours(12.5)
        );
        assert!(matches!(
            snapshot_time(EnginePreset::Realtime, Some("01.02.2024 10:00:00")),
            Ok(TimePoint::Clock(_))
        ));
        assert!(snapshot_time(EnginePreset::TestPlan, None).is_err());
        assert!(snapshot_time(EnginePreset::TestPlan, Some("01.02.2024 10:00:00")).is_err());
        assert!(snapshot_time(EnginePreset::Realtime, Some("soon")).is_err());
    }
}
