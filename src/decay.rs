//! Decay-gamma source spectra from the external ORIGEN run
//!
//! A segment power history is substituted into an ORIGEN input template,
//! the program is run on it, and the gamma source table of its report is
//! read back: one energy band per row, one intensity per decay time.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use crate::error::{DoseError, DoseResult};
use crate::history::SpanHistory;
use crate::table::{read_legacy_text, write_legacy_text};

pub mod constants {
    /// Decay times after shutdown, besides t = 0
    pub const DECAY_POINTS: usize = 10;

    pub const TIME_MARKER: &str = "t=[ 1234567890987654321.1234567890987654321 ]";
    pub const POWER_MARKER: &str = "power = [ 1234567890987654321.1234567890987654321e38 ]";
    pub const DECAY_MARKER: &str = "tt=[ 12 34 56 78 90 98 76 54 32 10 ]";

    pub const SPECTRUM_BANNER: &str = "Gamma source intensity (1/s) as a function of time";
    pub const BOUNDARY_HEADER: &str = "boundaries (MeV)";

    pub const EV_PER_MEV: f64 = 1e6;
}

use constants::*;

// ============================================================================
// Decay time grid
// ============================================================================

/// Decay times [h]: zero followed by log-spaced points up to the horizon
#[derive(Debug, Clone, PartialEq)]
pub struct DecayGrid {
    hours: Vec<f64>,
}

impl DecayGrid {
    /// `exp(n/10 * ln(max_hours))` for n = 1..=10, rounded to 0.1 h
    pub fn logarithmic(max_hours: f64) -> DoseResult<Self> {
        if !max_hours.is_finite() || max_hours <= 0.0 {
            return Err(DoseError::Config(format!(
                "decay horizon must be a positive number of hours, got {}",
                max_hours
            )));
        }
        let log_max = max_hours.ln();
        let mut hours = Vec::with_capacity(DECAY_POINTS + 1);
        hours.push(0.0);
        for n in 1..=DECAY_POINTS {
            let t = (n as f64 / DECAY_POINTS as f64 * log_max).exp();
            hours.push((t * 10.0).round() / 10.0);
        }
        Ok(Self { hours })
    }

    pub fn hours(&self) -> &[f64] {
        &self.hours
    }

    pub fn len(&self) -> usize {
        self.hours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }

    /// Replacement for the decay-time marker; t = 0 is implicit
    pub fn collaborator_string(&self) -> String {
        let times: Vec<String> = self.hours.iter().skip(1).map(|h| format!("{:.1}", h)).collect();
        format!("t = [{} ]", times.join(" "))
    }
}

// ============================================================================
// Source spectrum
// ============================================================================

/// Source intensities of one energy band [1/s], one per decay time
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBand {
    pub min_energy: f64, // [eV]
    pub max_energy: f64, // [eV]
    pub intensities: Vec<f64>,
}

impl SourceBand {
    pub fn contains(&self, energy: f64) -> bool {
        self.min_energy <= energy && energy <= self.max_energy
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSpectrum {
    bands: Vec<SourceBand>,
}

fn row_values(line: &str) -> Option<Vec<f64>> {
    let values = line
        .split_whitespace()
        .filter(|t| *t != "-")
        .map(|t| t.parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    if values.len() < 2 {
        return None;
    }
    Some(values)
}

impl SourceSpectrum {
    pub fn from_bands(bands: Vec<SourceBand>) -> Self {
        Self { bands }
    }

    /// Read the gamma source table of a report.
    ///
    /// The table follows the banner, a line of dashes and the boundary
    /// header; the first row that is not all numbers ends it.
    pub fn parse(source: &str, text: &str) -> DoseResult<Self> {
        let mut countdown = 3;
        let mut bands: Vec<SourceBand> = Vec::new();

        for line in text.lines() {
            if line.contains(SPECTRUM_BANNER) {
                countdown -= 1;
                continue;
            }
            if countdown == 2 && line.trim().chars().all(|c| c == '-') {
                countdown -= 1;
                continue;
            }
            if countdown == 1 && line.contains(BOUNDARY_HEADER) {
                countdown -= 1;
                continue;
            }
            if countdown == 0 {
                let values = match row_values(line) {
                    Some(v) => v,
                    None => break,
                };
                let band = SourceBand {
                    min_energy: EV_PER_MEV * values[0].min(values[1]),
                    max_energy: EV_PER_MEV * values[0].max(values[1]),
                    intensities: values[2..].to_vec(),
                };
                match bands.iter_mut().find(|b| {
                    b.min_energy == band.min_energy && b.max_energy == band.max_energy
                }) {
                    Some(existing) => *existing = band,
                    None => bands.push(band),
                }
            }
        }

        if countdown > 0 {
            return Err(DoseError::format(source, 0, "no gamma source intensity table"));
        }
        debug!("{}: {} source bands read", source, bands.len());
        Ok(Self { bands })
    }

    pub fn read(path: impl AsRef<Path>) -> DoseResult<Self> {
        let path = path.as_ref();
        let text = read_legacy_text(path)?;
        Self::parse(&path.display().to_string(), &text)
    }

    pub fn bands(&self) -> &[SourceBand] {
        &self.bands
    }

    /// First band that holds `energy`
    pub fn band_for(&self, energy: f64) -> Option<&SourceBand> {
        self.bands.iter().find(|b| b.contains(energy))
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

// ============================================================================
// The external program
// ============================================================================

/// Substitute the three markers of the input template
pub fn render_input(template: &str, time: &str, power: &str, decay: &str) -> DoseResult<String> {
    for marker in [TIME_MARKER, POWER_MARKER, DECAY_MARKER] {
        if !template.contains(marker) {
            return Err(DoseError::format(
                "decay input template",
                0,
                format!("marker {:?} not found", marker),
            ));
        }
    }
    Ok(template
        .replace(TIME_MARKER, time)
        .replace(POWER_MARKER, power)
        .replace(DECAY_MARKER, decay))
}

/// How to prepare, run and read the decay-spectrum program
#[derive(Debug, Clone)]
pub struct DecayProgram {
    pub executable: PathBuf,
    pub template: PathBuf,
    /// Where `<name>.inp` is written and `<name>.out` is expected
    pub work_dir: PathBuf,
    /// When false the existing reports are read without running anything
    pub launch: bool,
}

impl DecayProgram {
    /// Write `<name>.inp` for a power history
    pub fn write_input(&self, name: &str, history: &SpanHistory, grid: &DecayGrid) -> DoseResult<PathBuf> {
        let template = read_legacy_text(&self.template)?;
        let (time, power) = history.collaborator_params()?;
        let text = render_input(&template, &time, &power, &grid.collaborator_string())?;
        let path = self.work_dir.join(format!("{}.inp", name));
        write_legacy_text(&path, &text)?;
        debug!("{} saved", path.display());
        Ok(path)
    }

    /// Run the program on an input file and wait for it
    pub fn run(&self, input: &Path) -> DoseResult<()> {
        let program = self.executable.display().to_string();
        info!("Running {} {}", program, input.display());
        let output = Command::new(&self.executable)
            .arg(input)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|source| DoseError::Launch {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DoseError::Collaborator {
                program,
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        info!("{} finished successfully", program);
        Ok(())
    }

    /// Source spectrum for a power history: write the input, run the
    /// program if enabled, read `<name>.out`
    pub fn spectrum(&self, name: &str, history: &SpanHistory, grid: &DecayGrid) -> DoseResult<SourceSpectrum> {
        let input = self.write_input(name, history, grid)?;
        if self.launch {
            self.run(&input)?;
        } else {
            warn!("Decay program launch disabled, reading the existing {}.out", name);
        }
        SourceSpectrum::read(self.work_dir.join(format!("{}.out", name)))
    }
}
