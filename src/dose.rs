//! Handling dose rate around a spent fuel assembly
//!
//! The decay-gamma source of each axial segment is folded with the Green's
//! function of that segment to get the dissipated-energy flux spectrum in a
//! registration zone, which the NRB-99 conversion table turns into a dose
//! rate at every decay time.

use std::collections::BTreeMap;

use log::debug;
use ndarray::Array2;

use crate::decay::{DecayGrid, SourceSpectrum};
use crate::error::{DoseError, DoseResult};
use crate::green::{GreenFunction, GreenLibrary};

/// NRB-99 photon dose conversion
pub mod constants {
    /// (photon energy [eV], dose per fluence [1e-12 Sv*cm²])
    pub const DOSE_PER_FLUENCE: [(f64, f64); 22] = [
        (10e3, 0.0485),
        (15e3, 0.125),
        (20e3, 0.205),
        (30e3, 0.300),
        (40e3, 0.338),
        (50e3, 0.357),
        (60e3, 0.378),
        (80e3, 0.440),
        (0.1e6, 0.517),
        (0.15e6, 0.752),
        (0.2e6, 1.0),
        (0.3e6, 1.51),
        (0.4e6, 2.0),
        (0.5e6, 2.47),
        (0.6e6, 2.91),
        (0.8e6, 3.73),
        (1e6, 4.48),
        (2e6, 7.49),
        (4e6, 12.0),
        (6e6, 16.0),
        (8e6, 19.9),
        (10e6, 23.8),
    ];
    pub const DOSE_UNIT: f64 = 1e-12; // [Sv]

    /// Sv/s -> uSv/h
    pub const MICROSIEVERT_HOUR: f64 = 3600.0 * 1e6;
}

use constants::*;

/// Convert a Sv/s series to uSv/h
pub fn to_microsievert_per_hour(rates: &[f64]) -> Vec<f64> {
    rates.iter().map(|r| r * MICROSIEVERT_HOUR).collect()
}

/// Zone seen by an upper-half source segment through the mirrored lower
/// half: the remoteness (`zone / 10`) is kept and the height (`zone % 10`)
/// is reflected.
pub fn mirrored_zone(zone: i64, segments: usize) -> i64 {
    let remoteness = zone / 10;
    let height = zone % 10;
    10 * remoteness + (segments as i64 - height - 1)
}

pub struct DoseRateEngine<'a> {
    greens: &'a GreenLibrary,
    grid: &'a DecayGrid,
    segments: usize,
}

impl<'a> DoseRateEngine<'a> {
    /// The library must hold the lower half of `segments`, the middle one
    /// included when the count is odd
    pub fn new(greens: &'a GreenLibrary, grid: &'a DecayGrid, segments: usize) -> DoseResult<Self> {
        let needed = segments - segments / 2;
        if segments == 0 || greens.len() < needed {
            return Err(DoseError::Config(format!(
                "{} segments need {} Green's functions, {} loaded",
                segments,
                needed,
                greens.len()
            )));
        }
        Ok(Self {
            greens,
            grid,
            segments,
        })
    }

    /// Green's function and registration zone for source segment `src`
    /// (1-based) seen from `zone`
    fn source(&self, src: usize, zone: i64) -> DoseResult<(&'a GreenFunction, i64)> {
        let (index, reg_zone) = if src <= self.segments / 2 {
            (src, zone)
        } else {
            (self.segments + 1 - src, mirrored_zone(zone, self.segments))
        };
        let green = self.greens.get(index).ok_or_else(|| {
            DoseError::Config(format!("no Green's function for source segment {}", index))
        })?;
        Ok((green, reg_zone))
    }

    fn empty_flux(&self) -> Array2<f64> {
        Array2::zeros((self.greens.energy_grid().len(), self.grid.len()))
    }

    /// Add one source segment's contribution to the flux accumulator
    fn accumulate(
        &self,
        flux: &mut Array2<f64>,
        green: &GreenFunction,
        reg_zone: i64,
        weight: f64,
        spectrum: &SourceSpectrum,
    ) -> DoseResult<()> {
        let times = self.grid.len();
        for incident in &green.incident {
            let band = match spectrum.band_for(incident.energy) {
                Some(b) => b,
                None => continue,
            };
            let fluxes = incident.zones.get(&reg_zone).ok_or_else(|| {
                DoseError::Field(format!(
                    "registration zone {} is not tallied at {} eV",
                    reg_zone, incident.energy
                ))
            })?;
            for (e, f) in fluxes.iter().enumerate() {
                for (t, intensity) in band.intensities.iter().take(times).enumerate() {
                    flux[[e, t]] += weight * f * intensity;
                }
            }
        }
        Ok(())
    }

    /// Weight each conversion energy by the flux of the grid bucket whose
    /// window holds it
    fn dose_from_flux(&self, flux: &Array2<f64>) -> Vec<f64> {
        let energies = self.greens.energy_grid();
        let mut dose = vec![0.0; self.grid.len()];
        for (energy, factor) in DOSE_PER_FLUENCE {
            let bucket = (1..energies.len())
                .find(|&i| energies[i - 1] <= energy && energy <= energies[i]);
            if let Some(i) = bucket {
                for (t, d) in dose.iter_mut().enumerate() {
                    *d += flux[[i, t]] * factor * DOSE_UNIT;
                }
            }
        }
        dose
    }

    /// Dose rate [Sv/s] in `zone` from one spectrum spread over the
    /// segments with the `axial` weights
    pub fn envelope_dose_rate(
        &self,
        axial: &[f64],
        zone: i64,
        spectrum: &SourceSpectrum,
    ) -> DoseResult<Vec<f64>> {
        if axial.len() < self.segments {
            return Err(DoseError::Field(format!(
                "axial profile has {} weights for {} segments",
                axial.len(),
                self.segments
            )));
        }
        let mut flux = self.empty_flux();
        for src in 1..=self.segments {
            let (green, reg_zone) = self.source(src, zone)?;
            self.accumulate(&mut flux, green, reg_zone, axial[src - 1], spectrum)?;
        }
        let dose = self.dose_from_flux(&flux);
        debug!("zone {}: {:?} Sv/s", zone, dose);
        Ok(dose)
    }

    /// Dose rates [Sv/s] per zone from one spectrum per segment
    pub fn cell_dose_rates(
        &self,
        spectra: &[SourceSpectrum],
        zones: &[i64],
    ) -> DoseResult<BTreeMap<i64, Vec<f64>>> {
        if spectra.len() < self.segments {
            return Err(DoseError::Field(format!(
                "{} source spectra for {} segments",
                spectra.len(),
                self.segments
            )));
        }
        let mut rates = BTreeMap::new();
        for &zone in zones {
            let mut flux = self.empty_flux();
            for src in 1..=self.segments {
                let (green, reg_zone) = self.source(src, zone)?;
                self.accumulate(&mut flux, green, reg_zone, 1.0, &spectra[src - 1])?;
            }
            rates.insert(zone, self.dose_from_flux(&flux));
        }
        Ok(rates)
    }
}
