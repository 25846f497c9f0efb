//! Green's function library of a single fuel assembly
//!
//! For every source segment in the lower half of the assembly, MCU was run
//! once per incident gamma energy. Each run leaves a tally file with the
//! dissipated-energy flux spectrum in every registration zone around the
//! assembly and a parameter file naming the incident energy. The upper half
//! is served by mirroring (see [`crate::dose`]).
//!
//! Layout: `<dir>/TVS_<s>/TVS_N.FIN_S<n>` with the matching `STA<n:08>`.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{DoseError, DoseResult};
use crate::table::{is_number, read_legacy_text};

pub mod constants {
    /// Registration ring radii around the assembly axis [cm]
    pub const RING_RADII: [f64; 7] = [3.0, 4.0, 5.0, 6.0, 7.0, 39.0, 42.0];
    /// Height of one registration zone [cm]
    pub const ZONE_HEIGHT: f64 = 9.2;
    /// Zone remoteness (`zone / 10`) to outer ring radius [cm]
    pub const REMOTENESS_RADIUS: [(i64, f64); 5] =
        [(10, 4.0), (11, 5.0), (12, 6.0), (13, 7.0), (14, 42.0)];

    pub const TALLY_PREFIX: &str = "TVS_N.FIN_S";
    pub const ZONES_MARKER: &str = "-- ZONES --";
    pub const OBJECTS_MARKER: &str = "-- OBJECTS --";
    pub const FLUX_MARKER: &str = "FLUX";
    pub const ENERGY_MARKER: &str = "Energy";
    pub const ENERGY_PARAMETER: &str = "EMES";
}

use constants::*;

/// Volume of the ring a registration zone belongs to [cm³]
pub fn zone_volume(zone: i64) -> Option<f64> {
    let remoteness = zone / 10;
    let outer = REMOTENESS_RADIUS
        .iter()
        .find(|(r, _)| *r == remoteness)
        .map(|(_, radius)| *radius)?;
    let i = RING_RADII.iter().position(|r| *r == outer)?;
    let inner = *RING_RADII.get(i.checked_sub(1)?)?;
    Some(PI * (outer * outer - inner * inner) * ZONE_HEIGHT)
}

/// Flux tallies of one run: zone -> (dissipated energy [eV], flux) pairs
pub type ZoneTallies = BTreeMap<i64, Vec<(f64, f64)>>;

fn data_values(line: &str) -> Option<(f64, f64)> {
    let values = line
        .split_whitespace()
        .map(|t| t.parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    match values.as_slice() {
        [e, flux, ..] => Some((*e, *flux)),
        _ => None,
    }
}

fn zone_of(line: &str) -> Option<i64> {
    let rest = &line[line.find("ZONE:")? + "ZONE:".len()..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Read the per-zone flux spectra of one tally report
pub fn read_tally(source: &str, text: &str) -> DoseResult<ZoneTallies> {
    let mut zones = ZoneTallies::new();
    let mut countdown = 3;
    let mut zone: Option<i64> = None;
    let mut fluxes: Vec<(f64, f64)> = Vec::new();

    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.starts_with(ZONES_MARKER) {
            countdown -= 1;
            continue;
        }
        if countdown == 2 && line.starts_with(FLUX_MARKER) {
            countdown -= 1;
            zone = Some(zone_of(line).ok_or_else(|| {
                DoseError::format(source, n + 1, format!("no zone number in {:?}", line))
            })?);
            continue;
        }
        if countdown == 1 && line.starts_with(ENERGY_MARKER) {
            countdown -= 1;
            continue;
        }
        if countdown == 0 {
            match data_values(line) {
                Some((e, flux)) => match fluxes.iter_mut().find(|(x, _)| *x == e) {
                    Some(slot) => slot.1 = flux,
                    None => fluxes.push((e, flux)),
                },
                None => {
                    countdown = 2;
                    if let Some(z) = zone.take() {
                        zones.insert(z, std::mem::take(&mut fluxes));
                    }
                }
            }
        }
        if line.starts_with(OBJECTS_MARKER) {
            break;
        }
    }
    Ok(zones)
}

/// Divide every flux by the volume of its registration zone
pub fn normalise_by_volume(source: &str, zones: &mut ZoneTallies) -> DoseResult<()> {
    for (zone, fluxes) in zones.iter_mut() {
        let volume = zone_volume(*zone).ok_or_else(|| {
            DoseError::format(source, 0, format!("registration zone {} has no ring volume", zone))
        })?;
        for (_, flux) in fluxes.iter_mut() {
            *flux /= volume;
        }
    }
    Ok(())
}

/// Incident energy from an `STA` parameter file
pub fn read_incident_energy(path: &Path) -> DoseResult<f64> {
    let text = read_legacy_text(path)?;
    text.lines()
        .find_map(|line| {
            let rest = line.strip_prefix(ENERGY_PARAMETER)?;
            if !rest.starts_with(char::is_whitespace) {
                return None;
            }
            let value = rest.trim_start();
            if is_number(value) {
                value.parse::<f64>().ok()
            } else {
                None
            }
        })
        .ok_or_else(|| {
            DoseError::format(
                path.display().to_string(),
                0,
                format!("no {} line", ENERGY_PARAMETER),
            )
        })
}

/// Dissipated-energy response of every zone to one incident energy
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentResponse {
    pub energy: f64, // [eV]
    /// zone -> flux per energy of the library grid [1/cm²]
    pub zones: BTreeMap<i64, Vec<f64>>,
}

/// All incident energies for one source segment, sorted by energy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GreenFunction {
    pub incident: Vec<IncidentResponse>,
}

/// Green's functions of the lower-half source segments on a shared
/// dissipated-energy grid
#[derive(Debug, Clone, Default)]
pub struct GreenLibrary {
    grid: Vec<f64>,
    segments: Vec<GreenFunction>,
}

impl GreenLibrary {
    /// Assemble a library from raw tallies, one `(incident energy, tallies)`
    /// list per source segment starting from segment 1.
    ///
    /// The dissipated-energy grid is taken from the lowest zone of the
    /// lowest incident energy of segment 1; every other spectrum must use
    /// the same energies. A repeated incident energy keeps the run that
    /// comes last in input order.
    pub fn from_tallies(segments: Vec<Vec<(f64, ZoneTallies)>>) -> DoseResult<Self> {
        let mut segments = segments;
        for runs in segments.iter_mut() {
            runs.sort_by(|a, b| a.0.total_cmp(&b.0));
        }

        let grid: Vec<f64> = segments
            .first()
            .and_then(|runs| runs.first())
            .and_then(|(_, zones)| zones.values().next())
            .map(|fluxes| fluxes.iter().map(|(e, _)| *e).collect())
            .unwrap_or_default();

        let mut functions = Vec::with_capacity(segments.len());
        for (s, runs) in segments.into_iter().enumerate() {
            let mut incident: Vec<IncidentResponse> = Vec::with_capacity(runs.len());
            for (energy, zones) in runs {
                let mut aligned = BTreeMap::new();
                for (zone, fluxes) in zones {
                    let energies: Vec<f64> = fluxes.iter().map(|(e, _)| *e).collect();
                    if energies != grid {
                        return Err(DoseError::format(
                            format!("Green's function of segment {}", s + 1),
                            0,
                            format!(
                                "zone {} at incident energy {} eV uses a different energy grid",
                                zone, energy
                            ),
                        ));
                    }
                    aligned.insert(zone, fluxes.into_iter().map(|(_, f)| f).collect());
                }
                let response = IncidentResponse {
                    energy,
                    zones: aligned,
                };
                match incident.last_mut() {
                    Some(prev) if prev.energy == energy => *prev = response,
                    _ => incident.push(response),
                }
            }
            functions.push(GreenFunction { incident });
        }

        Ok(Self {
            grid,
            segments: functions,
        })
    }

    /// Load `TVS_1 ..= TVS_<count>` below `dir`
    pub fn load(dir: &Path, count: usize) -> DoseResult<Self> {
        let mut segments = Vec::with_capacity(count);
        for s in 1..=count {
            segments.push(load_segment(&dir.join(format!("TVS_{}", s)))?);
        }
        let library = Self::from_tallies(segments)?;
        info!(
            "Green's functions read: {} segments, {} energies on the grid",
            library.segments.len(),
            library.grid.len()
        );
        Ok(library)
    }

    /// Green's function of a source segment, 1-based
    pub fn get(&self, segment: usize) -> Option<&GreenFunction> {
        self.segments.get(segment.checked_sub(1)?)
    }

    /// Dissipated energies the fluxes are tallied at [eV]
    pub fn energy_grid(&self) -> &[f64] {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

fn load_segment(folder: &Path) -> DoseResult<Vec<(f64, ZoneTallies)>> {
    let mut runs = Vec::new();
    let entries = fs::read_dir(folder).map_err(|e| DoseError::io(folder, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DoseError::io(folder, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let number = match name.strip_prefix(TALLY_PREFIX) {
            Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => n,
            _ => continue,
        };
        if !path.is_file() {
            continue;
        }
        let number: u64 = number
            .parse()
            .map_err(|_| DoseError::format(name.clone(), 0, "tally number out of range"))?;

        let energy = read_incident_energy(&folder.join(format!("STA{:08}", number)))?;
        let text = fs::read_to_string(&path).map_err(|e| DoseError::io(&path, e))?;
        let source = path.display().to_string();
        let mut zones = read_tally(&source, &text)?;
        normalise_by_volume(&source, &mut zones)?;
        debug!("{}: {} eV, {} zones", source, energy, zones.len());
        runs.push((energy, zones));
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::write_legacy_text;

    const TALLY: &str = " MCU tally
 -- ZONES --
 FLUX  REACTION: 0   ZONE:   130
 Energy        Flux
   1.0E+05   2.0E+00
   2.0E+05   4.0E+00

 FLUX  REACTION: 0   ZONE:   131
 Energy        Flux
   1.0E+05   1.0E+00
   2.0E+05   3.0E+00
 total
 -- OBJECTS --
 FLUX  REACTION: 0   ZONE:   140
";

    #[test]
    fn test_zone_volume() {
        let v = zone_volume(130).unwrap();
        assert!((v - PI * 13.0 * 9.2).abs() < 1e-9);
        let v = zone_volume(145).unwrap();
        assert!((v - PI * (42.0 * 42.0 - 39.0 * 39.0) * 9.2).abs() < 1e-9);
        assert!(zone_volume(150).is_none());
        assert!(zone_volume(90).is_none());
    }

    #[test]
    fn test_read_tally() {
        let zones = read_tally("TVS_N.FIN_S1", TALLY).unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[&130], vec![(1.0e5, 2.0), (2.0e5, 4.0)]);
        assert_eq!(zones[&131][1], (2.0e5, 3.0));
    }

    #[test]
    fn test_mismatched_grid_is_rejected() {
        let mut a = ZoneTallies::new();
        a.insert(130, vec![(1.0, 1.0), (2.0, 1.0)]);
        let mut b = ZoneTallies::new();
        b.insert(130, vec![(1.0, 1.0), (3.0, 1.0)]);
        let err = GreenLibrary::from_tallies(vec![vec![(1.0e6, a), (2.0e6, b)]]).unwrap_err();
        assert!(matches!(err, DoseError::Format { .. }));
    }

    #[test]
    fn test_load_library_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        for s in 1..=2 {
            let folder = dir.path().join(format!("TVS_{}", s));
            fs::create_dir_all(&folder).unwrap();
            for (n, energy) in [(1, "5.0E+05"), (2, "1.5E+06")] {
                fs::write(folder.join(format!("TVS_N.FIN_S{}", n)), TALLY).unwrap();
                write_legacy_text(
                    folder.join(format!("STA{:08}", n)),
                    &format!("Источник\nEMES {}\n", energy),
                )
                .unwrap();
            }
            fs::write(folder.join("notes.txt"), "ignored").unwrap();
        }

        let library = GreenLibrary::load(dir.path(), 2).unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(library.energy_grid(), &[1.0e5, 2.0e5]);

        let g = library.get(2).unwrap();
        assert_eq!(g.incident.len(), 2);
        assert_eq!(g.incident[0].energy, 5.0e5);
        assert_eq!(g.incident[1].energy, 1.5e6);
        let flux = g.incident[0].zones[&130][1];
        assert!((flux - 4.0 / zone_volume(130).unwrap()).abs() < 1e-15);
        assert!(library.get(0).is_none());
        assert!(library.get(3).is_none());
    }

    #[test]
    fn test_duplicate_incident_energy_keeps_last() {
        let run = |flux: f64| {
            let mut zones = ZoneTallies::new();
            zones.insert(130, vec![(1.0e5, flux), (2.0e5, flux)]);
            zones
        };
        let library = GreenLibrary::from_tallies(vec![vec![
            (2.0e6, run(7.0)),
            (1.0e6, run(1.0)),
            (1.0e6, run(2.0)),
        ]])
        .unwrap();

        let g = library.get(1).unwrap();
        assert_eq!(g.incident.len(), 2);
        assert_eq!(g.incident[0].energy, 1.0e6);
        assert_eq!(g.incident[0].zones[&130], vec![2.0, 2.0]);
        assert_eq!(g.incident[1].zones[&130], vec![7.0, 7.0]);
    }

    #[test]
    fn test_missing_energy_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("STA00000001");
        fs::write(&path, "EMESX 1\n").unwrap();
        assert!(read_incident_energy(&path).is_err());
    }
}
