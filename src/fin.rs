//! Scanner for MCU simulation reports (FIN files)
//!
//! A report lists the per-zone tallies of every reaction that was requested.
//! Only two of them are wanted here: the detector reaction (3) and the
//! fission reaction (18), both in the ZONES section. Each is guarded by a
//! countdown that reaches zero once its marker and column header have been
//! seen; the OBJECTS section repeats the same tables and pushes both
//! countdowns out of reach.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, warn};

use crate::error::{DoseError, DoseResult};
use crate::schema::{AssemblySpanEntry, DetectorChannelEntry, FromRecord, Zoned};
use crate::table::{is_number, TypedTable};

/// Literal markers of the report layout
pub mod constants {
    pub const ZONES_MARKER: &str = " -- ZONES --";
    pub const OBJECTS_MARKER: &str = " -- OBJECTS --";
    pub const DETECTOR_MARKER: &str =
        " NUCLIDE:          MIXT, REACTION:            3, ENERGY:    0.00000E+00";
    pub const FISSION_MARKER: &str =
        " NUCLIDE:          MIXT, REACTION:           18, ENERGY:    0.00000E+00";
    pub const HEADER_LINE: &str = "         Zone          Mean        StdDev";

    pub const INITIAL_COUNTDOWN: i32 = 3;
    pub const BLOCK_INCREMENT: i32 = 10;
}

use constants::*;

/// One `zone mean stdev` tally line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneRecord {
    pub zone: i64,
    pub mean: f64,
    pub stdev: f64,
}

/// Fission tally enriched with the assembly segment it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct FissionRecord {
    pub zone: i64,
    pub cell: String,
    pub segment: usize,
    pub mean: f64,
    pub stdev: f64,
}

/// Detector tally enriched with its channel number
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorRecord {
    pub zone: i64,
    pub channel: i64,
    pub mean: f64,
    pub stdev: f64,
}

/// Parse a tally line.
///
/// The line must keep its terminator, start with whitespace and hold exactly
/// an integer zone followed by two numbers.
pub fn parse_zone_line(line: &str) -> Option<ZoneRecord> {
    let body = line
        .strip_suffix('\n')
        .or_else(|| line.strip_suffix('\r'))?;
    let body = body.strip_suffix('\r').unwrap_or(body);

    if !body.starts_with(char::is_whitespace) || body.ends_with(char::is_whitespace) {
        return None;
    }

    let mut tokens = body.split_whitespace();
    let zone = tokens.next()?;
    let mean = tokens.next()?;
    let stdev = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    if zone.is_empty() || !zone.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !is_number(mean) || !is_number(stdev) {
        return None;
    }

    Some(ZoneRecord {
        zone: zone.parse().ok()?,
        mean: mean.parse().ok()?,
        stdev: stdev.parse().ok()?,
    })
}

// ============================================================================
// Cross-reference lookups
// ============================================================================

/// Zone keyed view of a cross-reference table
#[derive(Debug, Clone)]
pub struct ZoneIndex<T> {
    entries: HashMap<i64, T>,
}

impl<T: FromRecord + Zoned> ZoneIndex<T> {
    /// Decode the table and index it by zone; the first row of a zone wins
    pub fn from_table(table: &TypedTable) -> DoseResult<Self> {
        let mut entries = HashMap::new();
        for entry in table.decode_all::<T>()? {
            entries.entry(entry.zone()).or_insert(entry);
        }
        Ok(Self { entries })
    }
}

impl<T> ZoneIndex<T> {
    pub fn get(&self, zone: i64) -> Option<&T> {
        self.entries.get(&zone)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }
}

impl<T: Zoned> FromIterator<T> for ZoneIndex<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut entries = HashMap::new();
        for entry in iter {
            entries.entry(entry.zone()).or_insert(entry);
        }
        Self { entries }
    }
}

pub type AssemblyZones = ZoneIndex<AssemblySpanEntry>;
pub type DetectorZones = ZoneIndex<DetectorChannelEntry>;

impl AssemblyZones {
    /// Soft lookup: `Ok(None)` when the zone is not an assembly segment
    pub fn enrich(&self, rec: &ZoneRecord) -> DoseResult<Option<FissionRecord>> {
        Ok(self.get(rec.zone).map(|span| FissionRecord {
            zone: rec.zone,
            cell: span.cell.clone(),
            segment: span.segment,
            mean: rec.mean,
            stdev: rec.stdev,
        }))
    }
}

impl DetectorZones {
    /// Soft lookup: `Ok(None)` when the zone is not a detector
    pub fn enrich(&self, rec: &ZoneRecord) -> DoseResult<Option<DetectorRecord>> {
        Ok(self.get(rec.zone).map(|det| DetectorRecord {
            zone: rec.zone,
            channel: det.channel,
            mean: rec.mean,
            stdev: rec.stdev,
        }))
    }
}

// ============================================================================
// Scanner
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Countdown {
    remaining: i32,
    finished: bool,
}

impl Default for Countdown {
    fn default() -> Self {
        Self {
            remaining: INITIAL_COUNTDOWN,
            finished: false,
        }
    }
}

impl Countdown {
    fn reading(&self) -> bool {
        self.remaining == 0
    }

    fn close(&mut self) {
        self.remaining += BLOCK_INCREMENT;
        self.finished = true;
    }
}

/// Records pulled out of one report
#[derive(Debug, Clone, Default)]
pub struct FinScan {
    pub detectors: Vec<DetectorRecord>,
    pub fissions: Vec<FissionRecord>,
    /// Detector tally lines whose zone is not in the channel table
    pub detector_misses: usize,
    /// Fission tally lines whose zone is not in the assembly table
    pub fission_misses: usize,
}

/// Scan a report file
pub fn scan_file(
    path: impl AsRef<Path>,
    assemblies: &AssemblyZones,
    detectors: &DetectorZones,
) -> DoseResult<FinScan> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| DoseError::io(path, e))?;
    scan(
        BufReader::new(file),
        &path.display().to_string(),
        assemblies,
        detectors,
    )
}

/// Scan a report stream.
///
/// Stops as soon as both reaction blocks are closed; a stream that ends
/// earlier yields whatever was collected and a warning.
pub fn scan<R: BufRead>(
    mut reader: R,
    source: &str,
    assemblies: &AssemblyZones,
    detectors: &DetectorZones,
) -> DoseResult<FinScan> {
    let mut out = FinScan::default();
    let mut detector = Countdown::default();
    let mut fission = Countdown::default();
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| DoseError::io(source, e))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        if line.starts_with(ZONES_MARKER) {
            detector.remaining -= 1;
            fission.remaining -= 1;
            continue;
        }
        if line.starts_with(OBJECTS_MARKER) {
            detector.remaining += BLOCK_INCREMENT;
            fission.remaining += BLOCK_INCREMENT;
            continue;
        }
        if line.starts_with(DETECTOR_MARKER) {
            detector.remaining -= 1;
            continue;
        }
        if line.starts_with(FISSION_MARKER) {
            fission.remaining -= 1;
            continue;
        }

        if detector.remaining == 1 && line.starts_with(HEADER_LINE) {
            detector.remaining -= 1;
            continue;
        }
        if detector.reading() {
            match parse_zone_line(&line) {
                Some(rec) => match detectors.enrich(&rec)? {
                    Some(d) => out.detectors.push(d),
                    None => {
                        debug!("{}:{}: zone {} is not a detector", source, line_no, rec.zone);
                        out.detector_misses += 1;
                    }
                },
                None => {
                    debug!("{}:{}: detector block closed", source, line_no);
                    detector.close();
                }
            }
        }

        if fission.remaining == 1 && line.starts_with(HEADER_LINE) {
            fission.remaining -= 1;
            continue;
        }
        if fission.reading() {
            match parse_zone_line(&line) {
                Some(rec) => match assemblies.enrich(&rec)? {
                    Some(f) => out.fissions.push(f),
                    None => {
                        debug!("{}:{}: zone {} is not a fuel segment", source, line_no, rec.zone);
                        out.fission_misses += 1;
                    }
                },
                None => {
                    debug!("{}:{}: fission block closed", source, line_no);
                    fission.close();
                }
            }
        }

        if detector.finished && fission.finished {
            return Ok(out);
        }
    }

    if !detector.finished || !fission.finished {
        warn!(
            "{}: report ended before both reaction blocks were read (detector: {}, fission: {})",
            source, detector.finished, fission.finished
        );
    }
    Ok(out)
}
