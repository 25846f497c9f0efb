//! Named record types decoded from typed tables
//!
//! Each input table kind declares the fields it needs; the indexes are
//! resolved once per table and every row is decoded into a plain struct.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{DoseError, DoseResult};
use crate::table::{FieldRef, TypedTable, Value, ZONE_FIELD};

/// A row type with a declared field list
pub trait FromRecord: Sized {
    /// Field names, in the order `decode` receives their values
    fn fields() -> &'static [&'static str];

    fn decode(values: &[&Value]) -> Result<Self, String>;
}

impl TypedTable {
    /// Decode every record into `T`, failing on the first bad row
    pub fn decode_all<T: FromRecord>(&self) -> DoseResult<Vec<T>> {
        let indexes = self.schema_indexes::<T>()?;
        self.records()
            .iter()
            .enumerate()
            .map(|(n, rec)| self.decode_row(&indexes, rec, n + 1))
            .collect()
    }

    /// First record whose `field` equals `value`, decoded into `T`.
    /// `Ok(None)` when no record matches.
    pub fn find_decoded<'a, T: FromRecord>(
        &self,
        field: impl Into<FieldRef<'a>>,
        value: &Value,
    ) -> DoseResult<Option<T>> {
        let indexes = self.schema_indexes::<T>()?;
        match self.get_item_by_field(field, value)? {
            Some(rec) => {
                let n = self
                    .records()
                    .iter()
                    .position(|r| r.as_slice() == rec)
                    .map_or(0, |i| i + 1);
                self.decode_row(&indexes, rec, n).map(Some)
            }
            None => Ok(None),
        }
    }

    fn schema_indexes<T: FromRecord>(&self) -> DoseResult<Vec<usize>> {
        T::fields()
            .iter()
            .map(|f| self.find_field_index(*f))
            .collect()
    }

    /// `record` is the 1-based data record number used in error reports
    fn decode_row<T: FromRecord>(&self, indexes: &[usize], rec: &[Value], record: usize) -> DoseResult<T> {
        let values = indexes
            .iter()
            .map(|&i| rec.get(i))
            .collect::<Option<Vec<&Value>>>()
            .ok_or_else(|| {
                DoseError::Field(format!("{} record {} is too short", self.source(), record))
            })?;
        T::decode(&values).map_err(|why| {
            DoseError::format(self.source(), record, format!("record {}: {}", record, why))
        })
    }
}

fn number(value: &Value, field: &str) -> Result<f64, String> {
    value
        .as_number()
        .ok_or_else(|| format!("{} must be a number, found {}", field, value))
}

/// Assembly counts must fit a non-negative 32-bit integer
fn count(value: &Value, field: &str) -> Result<u32, String> {
    let v = integer(value, field)?;
    u32::try_from(v).map_err(|_| format!("{} must be a non-negative count, found {}", field, v))
}

fn integer(value: &Value, field: &str) -> Result<i64, String> {
    let v = number(value, field)?;
    if v.fract() != 0.0 {
        return Err(format!("{} must be an integer, found {}", field, v));
    }
    Ok(v as i64)
}

/// Identifiers may be written as numbers in the file ("12") or text ("1-1")
fn identifier(value: &Value) -> String {
    match value {
        Value::Number(v) if v.fract() == 0.0 => format!("{}", *v as i64),
        other => other.to_string(),
    }
}

fn flag(value: &Value, field: &str) -> Result<bool, String> {
    match value {
        Value::Number(v) => Ok(*v != 0.0),
        Value::Text(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            _ => Err(format!("{} must be a flag, found {}", field, s)),
        },
        Value::Timestamp(_) => Err(format!("{} must be a flag, found {}", field, value)),
    }
}

/// Records keyed by a registration zone
pub trait Zoned {
    fn zone(&self) -> i64;
}

/// One row of the algorithm list (MCUFINs.txt)
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmEntry {
    pub name: String,
    pub hcrit: f64,
    pub assemblies: u32,
    pub fin_file: String,
    pub reference: bool,
}

impl FromRecord for AlgorithmEntry {
    fn fields() -> &'static [&'static str] {
        &["Algorithm", "Hcrit", "FAs", "FileName", "Reference"]
    }

    fn decode(v: &[&Value]) -> Result<Self, String> {
        Ok(AlgorithmEntry {
            name: identifier(v[0]),
            hcrit: number(v[1], "Hcrit")?,
            assemblies: count(v[2], "FAs")?,
            fin_file: identifier(v[3]),
            reference: flag(v[4], "Reference")?,
        })
    }
}

/// Zone to fuel assembly segment mapping (MCU_FAs.txt)
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblySpanEntry {
    pub zone: i64,
    pub cell: String,
    pub segment: usize,
}

impl FromRecord for AssemblySpanEntry {
    fn fields() -> &'static [&'static str] {
        &[ZONE_FIELD, "Cell", "Pitch"]
    }

    fn decode(v: &[&Value]) -> Result<Self, String> {
        let segment = integer(v[2], "Pitch")?;
        if segment < 0 {
            return Err(format!("Pitch must not be negative, found {}", segment));
        }
        Ok(AssemblySpanEntry {
            zone: integer(v[0], ZONE_FIELD)?,
            cell: identifier(v[1]),
            segment: segment as usize,
        })
    }
}

impl Zoned for AssemblySpanEntry {
    fn zone(&self) -> i64 {
        self.zone
    }
}

/// Zone to in-core detector channel mapping (MCU_detectors.txt)
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorChannelEntry {
    pub zone: i64,
    pub channel: i64,
}

impl FromRecord for DetectorChannelEntry {
    fn fields() -> &'static [&'static str] {
        &[ZONE_FIELD, "Channel"]
    }

    fn decode(v: &[&Value]) -> Result<Self, String> {
        Ok(DetectorChannelEntry {
            zone: integer(v[0], ZONE_FIELD)?,
            channel: integer(v[1], "Channel")?,
        })
    }
}

impl Zoned for DetectorChannelEntry {
    fn zone(&self) -> i64 {
        self.zone
    }
}

/// Reference detector effectiveness (detectors_eff.txt)
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivenessEntry {
    pub channel: i64,
    pub effectiveness: f64,
}

impl FromRecord for EffectivenessEntry {
    fn fields() -> &'static [&'static str] {
        &["Channel", "Eff"]
    }

    fn decode(v: &[&Value]) -> Result<Self, String> {
        Ok(EffectivenessEntry {
            channel: integer(v[0], "Channel")?,
            effectiveness: number(v[1], "Eff")?,
        })
    }
}

/// Point on the history time axis: a calendar timestamp for the real-time
/// history or hours for a test plan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimePoint {
    Clock(NaiveDateTime),
    Hours(f64),
}

/// One row of the core power history
#[derive(Debug, Clone, PartialEq)]
pub struct PowerHistoryRecord {
    pub time: TimePoint,
    pub power: f64,          // [W]
    pub algorithm: String,
    pub assemblies: u32,
}

impl FromRecord for PowerHistoryRecord {
    fn fields() -> &'static [&'static str] {
        &["t", "N(W)", "Algorithm", "FAs"]
    }

    fn decode(v: &[&Value]) -> Result<Self, String> {
        let time = match v[0] {
            Value::Timestamp(t) => TimePoint::Clock(*t),
            Value::Number(h) => TimePoint::Hours(*h),
            Value::Text(s) => return Err(format!("t must be a time, found {}", s)),
        };
        Ok(PowerHistoryRecord {
            time,
            power: number(v[1], "N(W)")?,
            algorithm: identifier(v[2]),
            assemblies: count(v[3], "FAs")?,
        })
    }
}

impl PowerHistoryRecord {
    /// Key of the algorithm active for this record
    pub fn algorithm_key(&self) -> (String, u32) {
        (self.algorithm.clone(), self.assemblies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_assembly_spans() {
        let table = TypedTable::parse(
            "MCU_FAs.txt",
            "RegZone\tCell\tPitch\n1001\t1-1\t0\n1002\t1-1\t1\n2001\t27\t0\n",
        )
        .unwrap();
        let spans: Vec<AssemblySpanEntry> = table.decode_all().unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].segment, 1);
        assert_eq!(spans[2].cell, "27");
    }

    #[test]
    fn test_decode_algorithm_list() {
        let table = TypedTable::parse(
            "MCUFINs.txt",
            "Algorithm\tHcrit\tFAs\tFileName\tReference\nP+M\t299\t241\tA.FIN\t1\nP+M+C\t280\t241\tB.FIN\t0\n",
        )
        .unwrap();
        let algs: Vec<AlgorithmEntry> = table.decode_all().unwrap();
        assert!(algs[0].reference);
        assert!(!algs[1].reference);
        assert_eq!(algs[1].assemblies, 241);
        assert_eq!(algs[1].fin_file, "B.FIN");
    }

    #[test]
    fn test_decode_history_in_hours() {
        let table = TypedTable::parse(
            "Test_Plan.txt",
            "t\tN(W)\tAlgorithm\tFAs\n0\t0\tP+M\t241\n1.5\t1000\tP+M\t241\n",
        )
        .unwrap();
        let recs: Vec<PowerHistoryRecord> = table.decode_all().unwrap();
        assert_eq!(recs[1].time, TimePoint::Hours(1.5));
        assert_eq!(recs[1].algorithm_key(), ("P+M".to_string(), 241));
    }

    #[test]
    fn test_missing_field_is_field_error() {
        let table = TypedTable::parse("eff", "Channel\tEffectiveness\n1\t0.5\n").unwrap();
        let err = table.decode_all::<EffectivenessEntry>().unwrap_err();
        assert!(matches!(err, DoseError::Field(_)));
    }

    #[test]
    fn test_find_decoded_soft_miss() {
        let table = TypedTable::parse("eff", "Channel\tEff\n7\t0.25\n8\t0.5\n").unwrap();
        let hit: Option<EffectivenessEntry> =
            table.find_decoded("Channel", &Value::Number(8.0)).unwrap();
        assert_eq!(hit.unwrap().effectiveness, 0.5);
        let miss: Option<EffectivenessEntry> =
            table.find_decoded("Channel", &Value::Number(9.0)).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_fractional_pitch_rejected() {
        let table = TypedTable::parse("fas", "RegZone\tCell\tPitch\n1\tA\t0.5\n").unwrap();
        assert!(table.decode_all::<AssemblySpanEntry>().is_err());
    }

    #[test]
    fn test_negative_assembly_count_rejected() {
        let table = TypedTable::parse(
            "MCUFINs.txt",
            "Algorithm\tHcrit\tFAs\tFileName\tReference\nP\t299\t241\tA.FIN\t1\nP\t299\t-2\tB.FIN\t0\n",
        )
        .unwrap();
        let err = table.decode_all::<AlgorithmEntry>().unwrap_err();
        assert!(matches!(err, DoseError::Format { line: 2, .. }));

        let history = TypedTable::parse("Test_Plan.txt", "t\tN(W)\tAlgorithm\tFAs\n0\t0\tP\t-241\n").unwrap();
        assert!(matches!(
            history.decode_all::<PowerHistoryRecord>(),
            Err(DoseError::Format { .. })
        ));
    }
}
