//! Burnup accumulation over the core power history
//!
//! The engine walks the chronologically sorted power history, spreads the
//! energy released in every interval over the fuel assembly segments with
//! the fission shares of the algorithm active in that interval, and keeps
//! two accumulators: all-time and the last two hours of the history. From
//! them it derives the segments with the highest burnup, an axial envelope
//! and the power histories the decay-spectrum program is fed with.
//!
//! One engine serves both the real-time history (calendar timestamps,
//! seconds) and test plans (hours); see [`EnginePreset`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::algorithm::{Algorithm, AlgorithmKey, AlgorithmModel};
use crate::error::{DoseError, DoseResult};
use crate::schema::{FromRecord, PowerHistoryRecord, TimePoint};
use crate::table::{TypedTable, Value, TIME_FORMAT};

pub mod constants {
    /// Largest power the first history record may carry [W]
    pub const FIRST_POWER_LIMIT: f64 = 1e-15;
    /// Offset added to history hours in decay-program input [h]
    pub const HOURS_SHIFT: f64 = 10000.0;
    /// Length of the trailing accumulation window [h]
    pub const TRAILING_WINDOW_HOURS: f64 = 2.0;
    /// Decay-program input takes power in MW
    pub const WATTS_PER_MW: f64 = 1e6;
}

use constants::*;

// ============================================================================
// Time axis
// ============================================================================

/// Flavour of power history the engine integrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePreset {
    /// Calendar timestamps, energy in W*s, axial envelope relative to the
    /// mean segment burnup of each assembly
    #[default]
    Realtime,
    /// Hours, energy in W*h, axial envelope from the peak fission shares
    TestPlan,
}

impl EnginePreset {
    /// Trailing window length in the preset's time unit
    pub fn window(&self) -> f64 {
        match self {
            EnginePreset::Realtime => TRAILING_WINDOW_HOURS * 3600.0,
            EnginePreset::TestPlan => TRAILING_WINDOW_HOURS,
        }
    }

    pub fn energy_unit(&self) -> &'static str {
        match self {
            EnginePreset::Realtime => "W*s",
            EnginePreset::TestPlan => "W*h",
        }
    }

    fn check(&self, t: &TimePoint) -> DoseResult<()> {
        match (self, t) {
            (EnginePreset::Realtime, TimePoint::Clock(_)) => Ok(()),
            (EnginePreset::TestPlan, TimePoint::Hours(_)) => Ok(()),
            (EnginePreset::Realtime, _) => Err(DoseError::HistoryInvalid(
                "real-time history needs calendar timestamps".into(),
            )),
            (EnginePreset::TestPlan, _) => Err(DoseError::HistoryInvalid(
                "test plan history needs times in hours".into(),
            )),
        }
    }

    /// Time from `from` to `to` in the preset's unit
    pub fn elapsed(&self, from: &TimePoint, to: &TimePoint) -> DoseResult<f64> {
        self.check(from)?;
        self.check(to)?;
        match self {
            EnginePreset::Realtime => Ok(hours_between(from, to)? * 3600.0),
            EnginePreset::TestPlan => hours_between(from, to),
        }
    }
}

/// Hours from `from` to `to`; both must be on the same axis
pub fn hours_between(from: &TimePoint, to: &TimePoint) -> DoseResult<f64> {
    match (from, to) {
        (TimePoint::Clock(a), TimePoint::Clock(b)) => {
            Ok((*b - *a).num_milliseconds() as f64 / 1000.0 / 3600.0)
        }
        (TimePoint::Hours(a), TimePoint::Hours(b)) => Ok(b - a),
        _ => Err(DoseError::HistoryInvalid(
            "timestamps and hours mixed in one history".into(),
        )),
    }
}

fn time_key(t: &TimePoint) -> f64 {
    match t {
        TimePoint::Clock(c) => c.and_utc().timestamp_millis() as f64 / 1000.0,
        TimePoint::Hours(h) => *h * 3600.0,
    }
}

/// Render a time the way history files carry it
pub fn render_time(t: &TimePoint) -> String {
    match t {
        TimePoint::Clock(c) => c.format(TIME_FORMAT).to_string(),
        TimePoint::Hours(h) => format!("{}", h),
    }
}

/// Time of a history cell: timestamps are clock times, numbers are hours
pub fn time_from_value(v: &Value) -> Option<TimePoint> {
    match v {
        Value::Timestamp(t) => Some(TimePoint::Clock(*t)),
        Value::Number(h) => Some(TimePoint::Hours(*h)),
        Value::Text(_) => None,
    }
}

// ============================================================================
// Histories
// ============================================================================

/// One point of a power history; envelope points also name the segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub time: TimePoint,
    pub value: f64, // [W]
    pub span: Option<(String, usize)>,
}

/// Power history of one segment (or of the envelope over all segments)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanHistory {
    points: Vec<HistoryPoint>,
    with_spans: bool,
}

impl SpanHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// History whose files carry the `Cell` and `Span` columns
    pub fn envelope() -> Self {
        Self {
            points: Vec::new(),
            with_spans: true,
        }
    }

    pub fn push(&mut self, time: TimePoint, value: f64, span: Option<(String, usize)>) {
        self.points.push(HistoryPoint { time, value, span });
    }

    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn sorted(&self) -> Vec<&HistoryPoint> {
        let mut points: Vec<&HistoryPoint> = self.points.iter().collect();
        points.sort_by(|a, b| time_key(&a.time).total_cmp(&time_key(&b.time)));
        points
    }

    fn header(&self) -> String {
        let time = match self.points.first().map(|p| &p.time) {
            Some(TimePoint::Hours(_)) => "Hours",
            _ => "DateTime",
        };
        if self.with_spans {
            format!("{}\tPower\tCell\tSpan\n", time)
        } else {
            format!("{}\tPower\n", time)
        }
    }

    fn row(&self, time: &TimePoint, point: &HistoryPoint) -> String {
        let mut line = format!("{}\t{}", render_time(time), point.value);
        if self.with_spans {
            match &point.span {
                Some((cell, span)) => {
                    let _ = write!(line, "\t{}\t{}", cell, span);
                }
                None => line.push_str("\t-\t-1"),
            }
        }
        line.push('\n');
        line
    }

    /// One row per point, in time order
    pub fn render_plain(&self) -> String {
        let mut out = self.header();
        for p in self.sorted() {
            out.push_str(&self.row(&p.time, p));
        }
        out
    }

    /// Staircase rendering: every point after the first is preceded by its
    /// value at the previous point's time
    pub fn render_stepped(&self) -> String {
        let mut out = self.header();
        let points = self.sorted();
        let (first, rest) = match points.split_first() {
            Some(split) => split,
            None => return out,
        };
        out.push_str(&self.row(&first.time, first));
        let mut prev_time = first.time;
        for p in rest {
            out.push_str(&self.row(&prev_time, p));
            out.push_str(&self.row(&p.time, p));
            prev_time = p.time;
        }
        out
    }

    pub fn write_plain(&self, path: impl AsRef<Path>) -> DoseResult<()> {
        let path = path.as_ref();
        fs::write(path, self.render_plain()).map_err(|e| DoseError::io(path, e))
    }

    pub fn write_stepped(&self, path: impl AsRef<Path>) -> DoseResult<()> {
        let path = path.as_ref();
        fs::write(path, self.render_stepped()).map_err(|e| DoseError::io(path, e))?;
        info!("{} written", path.display());
        Ok(())
    }

    /// Recover the original points from a stepped rendering
    pub fn parse_stepped(source: &str, text: &str) -> DoseResult<Self> {
        let table = TypedTable::parse(source, text)?;
        let span_columns = match (table.find_field_index("Cell"), table.find_field_index("Span")) {
            (Ok(c), Ok(s)) => Some((c, s)),
            _ => None,
        };
        let n = table.len();
        let mut history = Self {
            points: Vec::new(),
            with_spans: span_columns.is_some(),
        };

        for (i, rec) in table.records().iter().enumerate() {
            let keep = i == 0 || i + 1 == n || i % 2 == 0;
            if !keep {
                continue;
            }
            let bad = |what: &str| DoseError::format(source, i + 1, what.to_string());
            let time = rec.first().and_then(time_from_value).ok_or_else(|| bad("no time"))?;
            let value = rec
                .get(1)
                .and_then(Value::as_number)
                .ok_or_else(|| bad("no power"))?;
            let span = match span_columns {
                Some((c, s)) => {
                    let segment = rec.get(s).and_then(Value::as_number).unwrap_or(-1.0);
                    if segment == -1.0 {
                        None
                    } else if segment >= 0.0 && segment.fract() == 0.0 {
                        rec.get(c).map(|cell| (cell.to_string(), segment as usize))
                    } else {
                        return Err(bad("span must be -1 or a segment number"));
                    }
                }
                None => None,
            };
            history.points.push(HistoryPoint { time, value, span });
        }
        Ok(history)
    }

    pub fn read_stepped(path: impl AsRef<Path>) -> DoseResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DoseError::io(path, e))?;
        Self::parse_stepped(&path.display().to_string(), &text)
    }

    /// Time and power vectors for the decay-program input: hours since the
    /// first point plus [`HOURS_SHIFT`], power in MW
    pub fn collaborator_params(&self) -> DoseResult<(String, String)> {
        let origin = match self.points.first() {
            Some(p) => p.time,
            None => {
                return Err(DoseError::HistoryInvalid(
                    "empty history given to the decay program".into(),
                ))
            }
        };
        let mut hours = Vec::with_capacity(self.points.len());
        let mut powers = Vec::with_capacity(self.points.len());
        for p in &self.points {
            hours.push(format!("{:?}", hours_between(&origin, &p.time)? + HOURS_SHIFT));
            powers.push(format!("{:?}", p.value / WATTS_PER_MW));
        }
        Ok((
            format!("t = [ {}]", hours.join(" ")),
            format!("power = [ {}]", powers.join(" ")),
        ))
    }
}

// ============================================================================
// Accumulators and results
// ============================================================================

/// Energy per assembly segment: cell -> segment -> energy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Accumulator {
    pub burnup: BTreeMap<String, BTreeMap<usize, f64>>,
}

impl Accumulator {
    /// Zeroed accumulator over the segments an algorithm knows
    pub fn zeroed(alg: &Algorithm) -> Self {
        let burnup = alg
            .fuel
            .iter()
            .map(|(cell, fa)| (cell.clone(), fa.shares.keys().map(|s| (*s, 0.0)).collect()))
            .collect();
        Self { burnup }
    }

    pub fn get(&self, cell: &str, segment: usize) -> Option<f64> {
        self.burnup.get(cell)?.get(&segment).copied()
    }

    /// Segment with the largest positive energy
    pub fn max_point(&self) -> Option<SpanPoint> {
        let mut best: Option<SpanPoint> = None;
        let mut max = 0.0;
        for (cell, segs) in &self.burnup {
            for (seg, w) in segs {
                if *w > max {
                    max = *w;
                    best = Some(SpanPoint {
                        cell: cell.clone(),
                        segment: *seg,
                        energy: *w,
                    });
                }
            }
        }
        best
    }

    /// Energy summed over each assembly's segments
    pub fn assembly_totals(&self) -> BTreeMap<String, f64> {
        self.burnup
            .iter()
            .map(|(cell, segs)| (cell.clone(), segs.values().sum()))
            .collect()
    }

    /// Assembly with the largest positive total
    pub fn max_assembly(&self) -> Option<AssemblyTotal> {
        let mut best: Option<AssemblyTotal> = None;
        for (cell, energy) in self.assembly_totals() {
            if energy > best.as_ref().map_or(0.0, |b| b.energy) {
                best = Some(AssemblyTotal { cell, energy });
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanPoint {
    pub cell: String,
    pub segment: usize,
    pub energy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyTotal {
    pub cell: String,
    pub energy: f64,
}

/// Axial envelope weight of one segment and the assembly it came from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AxialPoint {
    pub segment: usize,
    pub cell: Option<String>,
    pub weight: f64,
}

/// Everything one integration pass produces
#[derive(Debug, Clone, Default)]
pub struct BurnupState {
    pub total: Accumulator,
    pub trailing: Accumulator,
    pub envelope: SpanHistory,
    pub max_history: SpanHistory,
    pub max2_history: SpanHistory,
    pub max_point: Option<SpanPoint>,
    pub max2_point: Option<SpanPoint>,
    pub max_assembly: Option<AssemblyTotal>,
    pub max2_assembly: Option<AssemblyTotal>,
    pub axial: Vec<AxialPoint>,
    missing_share_logged: bool,
}

impl BurnupState {
    /// Axial weights indexed by segment
    pub fn axial_weights(&self) -> Vec<f64> {
        self.axial.iter().map(|a| a.weight).collect()
    }
}

/// Serializable digest of a run
#[derive(Debug, Clone, Serialize)]
pub struct BurnupSummary {
    pub preset: EnginePreset,
    pub energy_unit: String,
    pub records: usize,
    pub segments: usize,
    pub reference_algorithm: String,
    pub first_time: TimePoint,
    pub last_time: TimePoint,
    pub max_point: Option<SpanPoint>,
    pub max2_point: Option<SpanPoint>,
    pub max_assembly: Option<AssemblyTotal>,
    pub max2_assembly: Option<AssemblyTotal>,
    pub axial: Vec<AxialPoint>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct BurnupEngine<'a> {
    model: &'a AlgorithmModel,
    preset: EnginePreset,
    records: Vec<PowerHistoryRecord>,
}

impl<'a> BurnupEngine<'a> {
    /// Sort and validate a power history.
    ///
    /// Fails with `HistoryInvalid` on an empty history, a first record with
    /// power, times on the wrong axis for the preset, or an algorithm key
    /// the model does not know.
    pub fn new(
        model: &'a AlgorithmModel,
        preset: EnginePreset,
        mut records: Vec<PowerHistoryRecord>,
    ) -> DoseResult<Self> {
        for rec in &records {
            preset.check(&rec.time)?;
            if model.get(&rec.algorithm_key()).is_none() {
                return Err(DoseError::HistoryInvalid(format!(
                    "unknown algorithm {} {} FAs",
                    rec.algorithm, rec.assemblies
                )));
            }
        }
        records.sort_by(|a, b| time_key(&a.time).total_cmp(&time_key(&b.time)));

        let first = records
            .first()
            .ok_or_else(|| DoseError::HistoryInvalid("history has no records".into()))?;
        if first.power > FIRST_POWER_LIMIT {
            return Err(DoseError::HistoryInvalid(
                "first record must have zero power".into(),
            ));
        }

        Ok(Self {
            model,
            preset,
            records,
        })
    }

    /// Read and validate a history table
    pub fn load(
        model: &'a AlgorithmModel,
        preset: EnginePreset,
        path: impl AsRef<Path>,
    ) -> DoseResult<Self> {
        let table = TypedTable::load(path)?;
        info!("{}: {} history records", table.source(), table.len());
        Self::new(model, preset, table.decode_all()?)
    }

    pub fn records(&self) -> &[PowerHistoryRecord] {
        &self.records
    }

    pub fn preset(&self) -> EnginePreset {
        self.preset
    }

    fn algorithm(&self, rec: &PowerHistoryRecord) -> DoseResult<&'a Algorithm> {
        let key: AlgorithmKey = rec.algorithm_key();
        self.model.get(&key).ok_or_else(|| {
            DoseError::HistoryInvalid(format!("unknown algorithm {} {} FAs", key.0, key.1))
        })
    }

    fn first_and_last(&self) -> DoseResult<(&PowerHistoryRecord, &PowerHistoryRecord)> {
        match (self.records.first(), self.records.last()) {
            (Some(f), Some(l)) => Ok((f, l)),
            _ => Err(DoseError::HistoryInvalid("history has no records".into())),
        }
    }

    /// Integrate the whole history
    pub fn run(&self) -> DoseResult<BurnupState> {
        let (first, last) = self.first_and_last()?;
        let reference = self.model.reference();

        let mut state = BurnupState {
            total: Accumulator::zeroed(reference),
            trailing: Accumulator::zeroed(reference),
            envelope: SpanHistory::envelope(),
            ..BurnupState::default()
        };
        state.envelope.push(first.time, first.power, None);

        let mut prev = first.time;
        for rec in &self.records[1..] {
            self.step(&mut state, &prev, rec, &last.time)?;
            prev = rec.time;
        }

        self.finish(&mut state)?;
        Ok(state)
    }

    /// Advance the accumulators over the interval ending at `rec`
    fn step(
        &self,
        state: &mut BurnupState,
        prev: &TimePoint,
        rec: &PowerHistoryRecord,
        last: &TimePoint,
    ) -> DoseResult<()> {
        let alg = self.algorithm(rec)?;
        let energy = rec.power * self.preset.elapsed(prev, &rec.time)?;
        let in_window = self.preset.elapsed(&rec.time, last)? < self.preset.window();

        let mut missing = false;
        let mut share = |cell: &str, seg: usize| {
            alg.share(cell, seg).unwrap_or_else(|| {
                missing = true;
                0.0
            })
        };

        let mut max_increment = 0.0;
        let mut peak: Option<(String, usize, f64)> = None;
        for (cell, segs) in state.total.burnup.iter_mut() {
            for (seg, w) in segs.iter_mut() {
                let k = share(cell.as_str(), *seg);
                let increment = energy * k;
                *w += increment;
                if increment > max_increment {
                    max_increment = increment;
                    peak = Some((cell.clone(), *seg, k));
                }
            }
        }

        if in_window {
            for (cell, segs) in state.trailing.burnup.iter_mut() {
                for (seg, w) in segs.iter_mut() {
                    *w += energy * share(cell.as_str(), *seg);
                }
            }
        }

        if missing && !state.missing_share_logged {
            debug!(
                "{} {} FAs lacks some reference segments, they get no energy",
                alg.name, alg.assemblies
            );
            state.missing_share_logged = true;
        }

        match peak {
            Some((cell, seg, k)) => state.envelope.push(rec.time, rec.power * k, Some((cell, seg))),
            None => state.envelope.push(rec.time, 0.0, None),
        }
        Ok(())
    }

    fn finish(&self, state: &mut BurnupState) -> DoseResult<()> {
        let unit = self.preset.energy_unit();

        state.max_point = state.total.max_point();
        state.max2_point = state.trailing.max_point();
        state.max_assembly = state.total.max_assembly();
        state.max2_assembly = state.trailing.max_assembly();
        if let Some(p) = &state.max_point {
            info!("Maximum burnup: cell {} span {} {} {}", p.cell, p.segment, p.energy, unit);
        }
        if let Some(p) = &state.max2_point {
            info!(
                "Maximum burnup for the last 2 hours: cell {} span {} {} {}",
                p.cell, p.segment, p.energy, unit
            );
        }
        if let Some(a) = &state.max_assembly {
            info!("FA with max burnup is {}: {} {}", a.cell, a.energy, unit);
        }

        state.axial = self.axial_envelope(&state.total);
        debug!("Axial envelope: {:?}", state.axial);

        let share_at = |alg: &Algorithm, point: &Option<SpanPoint>| {
            point
                .as_ref()
                .and_then(|p| alg.share(&p.cell, p.segment))
                .unwrap_or(0.0)
        };
        let mut max_history = SpanHistory::new();
        let mut max2_history = SpanHistory::new();
        for rec in &self.records {
            let alg = self.algorithm(rec)?;
            max_history.push(rec.time, rec.power * share_at(alg, &state.max_point), None);
            max2_history.push(rec.time, rec.power * share_at(alg, &state.max2_point), None);
        }
        state.max_history = max_history;
        state.max2_history = max2_history;
        Ok(())
    }

    fn axial_envelope(&self, total: &Accumulator) -> Vec<AxialPoint> {
        let segments = self.model.segment_count();
        let mut axial: Vec<AxialPoint> = (0..segments)
            .map(|segment| AxialPoint {
                segment,
                ..AxialPoint::default()
            })
            .collect();

        match self.preset {
            EnginePreset::Realtime => {
                for (cell, segs) in &total.burnup {
                    let mean = segs.values().sum::<f64>() / segments as f64;
                    if mean <= 0.0 {
                        continue;
                    }
                    for (seg, w) in segs {
                        let relative = w / mean;
                        if let Some(a) = axial.get_mut(*seg) {
                            if relative > a.weight {
                                a.weight = relative;
                                a.cell = Some(cell.clone());
                            }
                        }
                    }
                }
            }
            EnginePreset::TestPlan => {
                for cell in total.burnup.keys() {
                    for (_, alg) in self.model.iter() {
                        for a in axial.iter_mut() {
                            let peak = alg.share(cell, a.segment).unwrap_or(0.0)
                                * segments as f64
                                * f64::from(alg.assemblies);
                            if peak > a.weight {
                                a.weight = peak;
                                a.cell = Some(cell.clone());
                            }
                        }
                    }
                }
            }
        }
        axial
    }

    /// One power history per segment of `cell`
    pub fn cell_histories(&self, cell: &str) -> DoseResult<Vec<SpanHistory>> {
        if !self.model.reference().fuel.contains_key(cell) {
            return Err(DoseError::Field(format!("cell {} is not in the core", cell)));
        }
        let mut histories = vec![SpanHistory::new(); self.model.segment_count()];
        for rec in &self.records {
            let alg = self.algorithm(rec)?;
            for (seg, history) in histories.iter_mut().enumerate() {
                let k = alg.share(cell, seg).unwrap_or(0.0);
                history.push(rec.time, rec.power * k, None);
            }
        }
        Ok(histories)
    }

    pub fn summary(&self, state: &BurnupState) -> DoseResult<BurnupSummary> {
        let (first, last) = self.first_and_last()?;
        let (name, assemblies) = self.model.reference_key();
        Ok(BurnupSummary {
            preset: self.preset,
            energy_unit: self.preset.energy_unit().to_string(),
            records: self.records.len(),
            segments: self.model.segment_count(),
            reference_algorithm: format!("{} {} FAs", name, assemblies),
            first_time: first.time,
            last_time: last.time,
            max_point: state.max_point.clone(),
            max2_point: state.max2_point.clone(),
            max_assembly: state.max_assembly.clone(),
            max2_assembly: state.max2_assembly.clone(),
            axial: state.axial.clone(),
        })
    }
}

/// Append one core snapshot to the history log
pub fn append_history_record(path: impl AsRef<Path>, rec: &PowerHistoryRecord) -> DoseResult<()> {
    let path = path.as_ref();
    let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DoseError::io(path, e))?;
    if fresh {
        writeln!(file, "{}", PowerHistoryRecord::fields().join("\t"))
            .map_err(|e| DoseError::io(path, e))?;
    }
    writeln!(
        file,
        "{}\t{}\t{}\t{}",
        render_time(&rec.time),
        rec.power,
        rec.algorithm,
        rec.assemblies
    )
    .map_err(|e| DoseError::io(path, e))?;
    debug!("{}: appended {} W at {}", path.display(), rec.power, render_time(&rec.time));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{Algorithm, MissingChannelPolicy};
    use crate::fin::{FinScan, FissionRecord};
    use crate::schema::AlgorithmEntry;
    use chrono::NaiveDateTime;

    fn alg(name: &str, reference: bool, shares: &[(&str, usize, f64)]) -> Algorithm {
        let entry = AlgorithmEntry {
            name: name.to_string(),
            hcrit: 300.0,
            assemblies: 2,
            fin_file: String::new(),
            reference,
        };
        let scan = FinScan {
            fissions: shares
                .iter()
                .map(|&(cell, segment, mean)| FissionRecord {
                    zone: 0,
                    cell: cell.to_string(),
                    segment,
                    mean,
                    stdev: 0.0,
                })
                .collect(),
            ..FinScan::default()
        };
        Algorithm::from_scan(&entry, scan)
    }

    fn model(algs: Vec<Algorithm>) -> AlgorithmModel {
        let eff = TypedTable::parse("eff", "Channel\tEff\n1\t1\n").unwrap();
        AlgorithmModel::new(algs, &eff, MissingChannelPolicy::Skip).unwrap()
    }

    fn hours(h: f64, power: f64, name: &str) -> PowerHistoryRecord {
        PowerHistoryRecord {
            time: TimePoint::Hours(h),
            power,
            algorithm: name.to_string(),
            assemblies: 2,
        }
    }

    fn clock(s: &str) -> TimePoint {
        TimePoint::Clock(NaiveDateTime::parse_from_str(s, TIME_FORMAT).unwrap())
    }

    #[test]
    fn test_single_segment_scenario() {
        let m = model(vec![alg("A", true, &[("1-1", 0, 1.0)])]);
        let records = vec![
            PowerHistoryRecord {
                time: clock("01.01.2024 00:00:00"),
                power: 0.0,
                algorithm: "A".into(),
                assemblies: 2,
            },
            PowerHistoryRecord {
                time: clock("01.01.2024 01:00:00"),
                power: 1000.0,
                algorithm: "A".into(),
                assemblies: 2,
            },
        ];
        let engine = BurnupEngine::new(&m, EnginePreset::Realtime, records).unwrap();
        let state = engine.run().unwrap();
        assert_eq!(state.total.get("1-1", 0), Some(1000.0 * 3600.0));
        assert_eq!(state.trailing.get("1-1", 0), Some(1000.0 * 3600.0));
        assert_eq!(state.max_point.as_ref().unwrap().cell, "1-1");
        assert_eq!(state.envelope.len(), 2);
        assert_eq!(state.envelope.points()[1].value, 1000.0);
        assert_eq!(state.axial_weights(), vec![1.0]);
    }

    #[test]
    fn test_first_record_must_be_zero_power() {
        let m = model(vec![alg("A", true, &[("1-1", 0, 1.0)])]);
        let err = BurnupEngine::new(
            &m,
            EnginePreset::TestPlan,
            vec![hours(1.0, 0.0, "A"), hours(0.0, 5.0, "A")],
        )
        .err()
        .unwrap();
        assert!(err.is_history_invalid());
    }

    #[test]
    fn test_unknown_algorithm_and_wrong_axis() {
        let m = model(vec![alg("A", true, &[("1-1", 0, 1.0)])]);
        let err = BurnupEngine::new(&m, EnginePreset::TestPlan, vec![hours(0.0, 0.0, "B")])
            .err()
            .unwrap();
        assert!(err.is_history_invalid());
        let err = BurnupEngine::new(&m, EnginePreset::Realtime, vec![hours(0.0, 0.0, "A")])
            .err()
            .unwrap();
        assert!(err.is_history_invalid());
    }

    #[test]
    fn test_trailing_window_and_switching_algorithms() {
        let shares_a = [("1-1", 0, 3.0), ("1-1", 1, 1.0)];
        let shares_b = [("1-1", 0, 1.0), ("1-1", 1, 3.0)];
        let m = model(vec![alg("A", true, &shares_a), alg("B", false, &shares_b)]);
        let records = vec![
            hours(0.0, 0.0, "A"),
            hours(10.0, 100.0, "A"),
            hours(11.0, 100.0, "B"),
            hours(12.0, 200.0, "B"),
        ];
        let engine = BurnupEngine::new(&m, EnginePreset::TestPlan, records).unwrap();
        let state = engine.run().unwrap();

        // 1000 W*h under A, then 100 and 200 W*h under B
        assert!((state.total.get("1-1", 0).unwrap() - (750.0 + 25.0 + 50.0)).abs() < 1e-9);
        assert!((state.total.get("1-1", 1).unwrap() - (250.0 + 75.0 + 150.0)).abs() < 1e-9);
        // only the records at 11 h and 12 h fall inside the last two hours
        assert!((state.trailing.get("1-1", 1).unwrap() - 225.0).abs() < 1e-9);
        for (cell, segs) in &state.total.burnup {
            for (seg, w) in segs {
                assert!(*w >= state.trailing.get(cell, *seg).unwrap());
            }
        }

        let max = state.max_point.as_ref().unwrap();
        assert_eq!((max.cell.as_str(), max.segment), ("1-1", 0));
        let max2 = state.max2_point.as_ref().unwrap();
        assert_eq!(max2.segment, 1);

        // power times the max segment's share under the active algorithm
        let values: Vec<f64> = state.max_history.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 75.0, 25.0, 50.0]);

        // peak share 0.75 over 2 segments and 2 assemblies
        assert_eq!(state.axial_weights(), vec![3.0, 3.0]);
        assert_eq!(state.max_assembly.as_ref().unwrap().cell, "1-1");
    }

    #[test]
    fn test_zero_power_history_has_no_maxima() {
        let m = model(vec![alg("A", true, &[("1-1", 0, 1.0), ("2-1", 0, 1.0)])]);
        let records = vec![hours(0.0, 0.0, "A"), hours(5.0, 0.0, "A")];
        let engine = BurnupEngine::new(&m, EnginePreset::TestPlan, records).unwrap();
        let state = engine.run().unwrap();
        assert!(state.total.burnup.values().flat_map(|s| s.values()).all(|w| *w == 0.0));
        assert!(state.max_point.is_none());
        assert!(state.max2_point.is_none());
        assert!(state.max_assembly.is_none());
        assert!(state.max_history.points().iter().all(|p| p.value == 0.0));
        assert_eq!(state.envelope.points()[1].span, None);
    }

    #[test]
    fn test_zero_power_history_gives_zero_dose() {
        use crate::decay::{DecayGrid, SourceBand, SourceSpectrum};
        use crate::dose::DoseRateEngine;
        use crate::green::{GreenLibrary, ZoneTallies};

        let m = model(vec![alg(
            "A",
            true,
            &[("1-1", 0, 1.0), ("1-1", 1, 2.0), ("2-1", 0, 3.0), ("2-1", 1, 4.0)],
        )]);
        let records = vec![
            PowerHistoryRecord {
                time: clock("01.01.2024 00:00:00"),
                power: 0.0,
                algorithm: "A".into(),
                assemblies: 2,
            },
            PowerHistoryRecord {
                time: clock("01.01.2024 05:00:00"),
                power: 0.0,
                algorithm: "A".into(),
                assemblies: 2,
            },
        ];
        let engine = BurnupEngine::new(&m, EnginePreset::Realtime, records).unwrap();
        let state = engine.run().unwrap();
        let axial = state.axial_weights();
        assert_eq!(axial, vec![0.0, 0.0]);

        let mut zones = ZoneTallies::new();
        zones.insert(130, vec![(1.0e5, 2.0), (2.0e5, 4.0)]);
        zones.insert(131, vec![(1.0e5, 1.0), (2.0e5, 3.0)]);
        let greens = GreenLibrary::from_tallies(vec![vec![(1.0e6, zones)]]).unwrap();
        let grid = DecayGrid::logarithmic(320.0).unwrap();
        let spectrum = SourceSpectrum::from_bands(vec![SourceBand {
            min_energy: 0.5e6,
            max_energy: 1.5e6,
            intensities: vec![1.0e10; 11],
        }]);

        let doses = DoseRateEngine::new(&greens, &grid, m.segment_count()).unwrap();
        for zone in [130, 131] {
            let dose = doses.envelope_dose_rate(&axial, zone, &spectrum).unwrap();
            assert_eq!(dose.len(), grid.len());
            assert!(dose.iter().all(|d| *d == 0.0));
        }
    }

    #[test]
    fn test_stepped_roundtrip() {
        let mut history = SpanHistory::new();
        for (h, v) in [(0.0, 0.0), (1.5, 250.0), (3.0, 125.5), (4.25, 0.0)] {
            history.push(TimePoint::Hours(h), v, None);
        }
        let text = history.render_stepped();
        assert_eq!(text.lines().count(), 1 + 7);
        let back = SpanHistory::parse_stepped("maxW_history.txt", &text).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn test_stepped_roundtrip_is_lossless() {
        let mut history = SpanHistory::new();
        history.push(TimePoint::Hours(0.0), 0.0, None);
        history.push(TimePoint::Hours(1.0 / 3.0), 1000.0 / 3.0, None);
        history.push(TimePoint::Hours(2.0), 1.0e7 / 7.0, None);
        history.push(TimePoint::Hours(2.0 + 1.0e-9), 0.1 + 0.2, None);
        let back = SpanHistory::parse_stepped("maxW_history.txt", &history.render_stepped()).unwrap();
        assert_eq!(back, history);
        assert_eq!(back.points()[1].time, TimePoint::Hours(0.3333333333333333));
        assert_eq!(back.points()[2].value, 1428571.4285714286);
    }

    #[test]
    fn test_stepped_span_column_checked() {
        let header = "Hours\tPower\tCell\tSpan\n";
        let ok = format!("{}0\t0\t-\t-1\n1\t5\t1-1\t3\n", header);
        let history = SpanHistory::parse_stepped("env", &ok).unwrap();
        assert_eq!(history.points()[0].span, None);
        assert_eq!(history.points()[1].span, Some(("1-1".to_string(), 3)));

        for span in ["-2", "1.5"] {
            let text = format!("{}0\t0\t-\t-1\n1\t5\t1-1\t{}\n", header, span);
            let err = SpanHistory::parse_stepped("env", &text).unwrap_err();
            assert!(matches!(err, DoseError::Format { line: 2, .. }));
        }
    }

    #[test]
    fn test_stepped_envelope_roundtrip() {
        let mut history = SpanHistory::envelope();
        history.push(clock("01.01.2024 00:00:00"), 0.0, None);
        history.push(clock("01.01.2024 06:00:00"), 12.5, Some(("1-1".into(), 3)));
        history.push(clock("01.01.2024 07:30:00"), 8.0, Some(("2-1".into(), 0)));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env_history.txt");
        history.write_stepped(&path).unwrap();
        assert_eq!(SpanHistory::read_stepped(&path).unwrap(), history);
    }

    #[test]
    fn test_collaborator_params() {
        let mut history = SpanHistory::new();
        history.push(clock("01.01.2024 00:00:00"), 0.0, None);
        history.push(clock("01.01.2024 03:00:00"), 2.0e6, None);
        let (t, p) = history.collaborator_params().unwrap();
        assert_eq!(t, "t = [ 10000.0 10003.0]");
        assert_eq!(p, "power = [ 0.0 2.0]");
    }

    #[test]
    fn test_cell_histories() {
        let m = model(vec![alg("A", true, &[("1-1", 0, 1.0), ("1-1", 1, 3.0)])]);
        let records = vec![hours(0.0, 0.0, "A"), hours(1.0, 100.0, "A")];
        let engine = BurnupEngine::new(&m, EnginePreset::TestPlan, records).unwrap();
        let histories = engine.cell_histories("1-1").unwrap();
        assert_eq!(histories.len(), 2);
        assert_eq!(histories[1].points()[1].value, 75.0);
        assert!(engine.cell_histories("9-9").is_err());
    }

    #[test]
    fn test_append_history_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Core_history.txt");
        fs::write(&path, "t\tN(W)\tAlgorithm\tFAs\n").unwrap();
        let mut rec = hours(0.0, 0.0, "P+M");
        rec.time = clock("01.02.2024 10:00:00");
        append_history_record(&path, &rec).unwrap();
        rec.time = clock("01.02.2024 11:00:00");
        rec.power = 1.5e9;
        append_history_record(&path, &rec).unwrap();

        let table = TypedTable::load(&path).unwrap();
        let records: Vec<PowerHistoryRecord> = table.decode_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].power, 1.5e9);
        assert_eq!(records[1].time, clock("01.02.2024 11:00:00"));
    }

    #[test]
    fn test_append_starts_new_log_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test_Plan.txt");
        append_history_record(&path, &hours(0.0, 0.0, "P+M")).unwrap();
        append_history_record(&path, &hours(2.0, 1000.0, "P+M")).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("t\tN(W)\tAlgorithm\tFAs\n"));
        let records: Vec<PowerHistoryRecord> =
            TypedTable::load(&path).unwrap().decode_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].time, TimePoint::Hours(2.0));
    }
}
