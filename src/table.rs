//! Schema-inferring reader for tab-delimited data tables
//!
//! Every configuration and history file of the calculation is a plain text
//! table: optional `#` comment lines, an optional header line with field
//! names, then one record per line. Column types are inferred from the first
//! record that populates a column and enforced on every later record.

use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use crate::error::{DoseError, DoseResult};

/// Lines starting with this marker before the first meaningful line are skipped
pub const COMMENT_MARKER: char = '#';

/// Field separator
pub const DELIMITER: char = '\t';

/// Field acting as the implicit primary key of zone-indexed tables
pub const ZONE_FIELD: &str = "RegZone";

/// Calendar timestamp layout used in every table
pub const TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// A single typed table cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Number,
    Timestamp,
    Text,
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Number(_) => ColumnType::Number,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Text(_) => ColumnType::Text,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Position on a numeric axis, used for interpolation.
    /// Timestamps map to seconds since the Unix epoch.
    fn coordinate(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Timestamp(t) => {
                let utc = t.and_utc();
                Some(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) * 1e-9)
            }
            Value::Text(_) => None,
        }
    }

    fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            // Columns are homogeneous, mixed comparisons only come from bad callers
            (a, b) => (a.column_type() as u8).cmp(&(b.column_type() as u8)),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::Timestamp(t) => write!(f, "{}", t.format(TIME_FORMAT)),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Field reference by name or by position
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Name(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self {
        FieldRef::Name(name)
    }
}

impl From<usize> for FieldRef<'_> {
    fn from(index: usize) -> Self {
        FieldRef::Index(index)
    }
}

/// Loaded table, read-only after construction apart from sorting
#[derive(Debug, Clone)]
pub struct TypedTable {
    source: String,
    fields: Vec<String>,
    types: Vec<ColumnType>,
    records: Vec<Vec<Value>>,
}

impl TypedTable {
    /// Read and parse a table file
    pub fn load(path: impl AsRef<Path>) -> DoseResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DoseError::io(path, e))?;
        let table = Self::parse(&path.display().to_string(), &text)?;
        log::debug!(
            "{}: fields {:?}, {} data records",
            path.display(),
            table.fields,
            table.records.len()
        );
        Ok(table)
    }

    /// Parse table text; `source` only names the table in error messages
    pub fn parse(source: &str, text: &str) -> DoseResult<Self> {
        let mut table = TypedTable {
            source: source.to_string(),
            fields: Vec::new(),
            types: Vec::new(),
            records: Vec::new(),
        };

        let mut lines = text.lines().enumerate().map(|(n, l)| (n + 1, l));
        let mut first_meaningful = None;
        for (line_no, line) in lines.by_ref() {
            if line.starts_with(COMMENT_MARKER) {
                continue;
            }
            first_meaningful = Some((line_no, line));
            break;
        }

        let Some((first_no, first_line)) = first_meaningful else {
            return Ok(table);
        };

        let first_tokens = split_line(first_line);
        if !first_tokens.is_empty() && first_tokens.iter().all(|t| is_header_token(t)) {
            table.fields = first_tokens.iter().map(|t| t.to_string()).collect();
        } else {
            table.push_line(first_no, first_line)?;
        }

        for (line_no, line) in lines {
            table.push_line(line_no, line)?;
        }

        Ok(table)
    }

    fn push_line(&mut self, line_no: usize, line: &str) -> DoseResult<()> {
        if line.trim().is_empty() {
            return Ok(());
        }

        let record = split_line(line)
            .into_iter()
            .map(|token| {
                classify(token).ok_or_else(|| {
                    DoseError::format(&self.source, line_no, format!("error parsing {}", token))
                })
            })
            .collect::<DoseResult<Vec<Value>>>()?;

        self.check_record(line_no, &record)?;
        self.records.push(record);
        Ok(())
    }

    fn check_record(&mut self, line_no: usize, record: &[Value]) -> DoseResult<()> {
        if !self.fields.is_empty() && record.len() > self.fields.len() {
            return Err(DoseError::format(
                &self.source,
                line_no,
                format!("{} fields but {} data values", self.fields.len(), record.len()),
            ));
        }
        if record.len() < self.types.len() {
            return Err(DoseError::format(
                &self.source,
                line_no,
                format!("{} data values but {} expected", record.len(), self.types.len()),
            ));
        }
        // More values than known types: the type vector grows
        for value in &record[self.types.len()..] {
            self.types.push(value.column_type());
        }
        for (value, expected) in record.iter().zip(&self.types) {
            if value.column_type() != *expected {
                return Err(DoseError::format(
                    &self.source,
                    line_no,
                    format!(
                        "type mismatch: {} has type {:?} but {:?} expected",
                        value,
                        value.column_type(),
                        expected
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Header field names, empty when the table has no header line
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn records(&self) -> &[Vec<Value>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve a field name or position to a column index
    pub fn find_field_index<'a>(&self, field: impl Into<FieldRef<'a>>) -> DoseResult<usize> {
        match field.into() {
            FieldRef::Name(name) => self
                .fields
                .iter()
                .position(|f| f == name)
                .ok_or_else(|| DoseError::Field(format!("No {} field", name))),
            FieldRef::Index(index) => {
                let width = self.fields.len().max(self.types.len());
                if index < width {
                    Ok(index)
                } else {
                    Err(DoseError::Field(format!("Field {} is not recognized", index)))
                }
            }
        }
    }

    /// Sort records in place by one field
    pub fn sort_by_field<'a>(&mut self, field: impl Into<FieldRef<'a>>) -> DoseResult<()> {
        let index = self.find_field_index(field)?;
        self.records.sort_by(|a, b| a[index].compare(&b[index]));
        Ok(())
    }

    /// Interpolate a whole record between the two records bracketing `target`
    /// on the given field. String cells come back as `None`.
    pub fn interpolate_by_field<'a>(
        &mut self,
        field: impl Into<FieldRef<'a>>,
        target: &Value,
    ) -> DoseResult<Vec<Option<Value>>> {
        let index = self.find_field_index(field)?;
        if self.types.get(index) == Some(&ColumnType::Text) {
            let name = self.fields.get(index).cloned().unwrap_or_else(|| index.to_string());
            return Err(DoseError::Field(format!(
                "Can't interpolate on {} field of string type",
                name
            )));
        }
        if self.records.len() < 2 {
            return Err(DoseError::Field(format!(
                "{} has {} records, interpolation needs two",
                self.source,
                self.records.len()
            )));
        }
        let x = target
            .coordinate()
            .ok_or_else(|| DoseError::Field(format!("Can't interpolate to {}", target)))?;

        self.sort_by_field(FieldRef::Index(index))?;
        let mut idx = self
            .records
            .iter()
            .position(|rec| rec[index].compare(target) == Ordering::Greater)
            .unwrap_or(self.records.len() - 1);
        if idx == 0 {
            idx = 1;
        }

        let prev = &self.records[idx - 1];
        let next = &self.records[idx];
        let x0 = prev[index].coordinate().unwrap_or(0.0);
        let x1 = next[index].coordinate().unwrap_or(0.0);
        let k = if x1 == x0 { 0.0 } else { (x - x0) / (x1 - x0) };
        Ok(lerp_records(prev, next, k))
    }

    /// Interpolate by fractional record position, clamped to the table bounds
    pub fn interpolate_by_rec_no(&self, position: f64) -> DoseResult<Vec<Option<Value>>> {
        let n = self.records.len();
        if n == 0 {
            return Err(DoseError::Field(format!("{} has no records", self.source)));
        }
        let last = (n - 1) as f64;
        let position = position.clamp(0.0, last);
        let idx = position.floor() as usize;
        if idx + 1 >= n {
            return Ok(lerp_records(&self.records[n - 1], &self.records[n - 1], 0.0));
        }
        Ok(lerp_records(
            &self.records[idx],
            &self.records[idx + 1],
            position - idx as f64,
        ))
    }

    /// First record whose field equals `value`; `Ok(None)` when absent
    pub fn get_item_by_field<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
        value: &Value,
    ) -> DoseResult<Option<&[Value]>> {
        let index = self.find_field_index(field)?;
        Ok(self
            .records
            .iter()
            .find(|rec| rec.get(index) == Some(value))
            .map(|rec| rec.as_slice()))
    }

    /// Membership test on the zone key
    pub fn contains_zone(&self, zone: i64) -> DoseResult<bool> {
        Ok(self.zone_record(zone)?.is_some())
    }

    /// Exact retrieval by the zone key; `Ok(None)` when the zone is absent
    pub fn zone_record(&self, zone: i64) -> DoseResult<Option<&[Value]>> {
        self.get_item_by_field(ZONE_FIELD, &Value::Number(zone as f64))
    }
}

fn split_line(line: &str) -> Vec<&str> {
    line.trim_end_matches('\r').split(DELIMITER).collect()
}

fn is_header_token(token: &str) -> bool {
    match token.chars().next() {
        Some(c) => !c.is_ascii_digit() && !token.contains(char::is_whitespace) && !is_number(token),
        None => false,
    }
}

/// Classify a field as number, timestamp or string, in that priority
pub fn classify(token: &str) -> Option<Value> {
    if is_number(token) {
        return token.parse().ok().map(Value::Number);
    }
    if is_timestamp_shape(token) {
        if let Ok(t) = NaiveDateTime::parse_from_str(token, TIME_FORMAT) {
            return Some(Value::Timestamp(t));
        }
    }
    if !token.is_empty() && !token.contains(char::is_whitespace) {
        return Some(Value::Text(token.to_string()));
    }
    None
}

/// `[-+]?[0-9]*[.]?[0-9]+([eE][-+]?[0-9]+)?`
pub fn is_number(token: &str) -> bool {
    let b = token.as_bytes();
    let mut i = 0;
    let digits = |i: &mut usize| {
        let start = *i;
        while *i < b.len() && b[*i].is_ascii_digit() {
            *i += 1;
        }
        *i - start
    };

    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    let int_digits = digits(&mut i);
    if i < b.len() && b[i] == b'.' {
        i += 1;
        if digits(&mut i) == 0 {
            return false;
        }
    } else if int_digits == 0 {
        return false;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        if digits(&mut i) == 0 {
            return false;
        }
    }
    i == b.len()
}

// D{1,2}.MM.YYYY H{1,2}:MM:SS
fn is_timestamp_shape(token: &str) -> bool {
    let Some((date, time)) = token.split_once(' ') else {
        return false;
    };
    let date: Vec<&str> = date.split('.').collect();
    let time: Vec<&str> = time.split(':').collect();
    let numeric = |s: &str, min: usize, max: usize| {
        (min..=max).contains(&s.len()) && s.bytes().all(|c| c.is_ascii_digit())
    };
    date.len() == 3
        && time.len() == 3
        && numeric(date[0], 1, 2)
        && numeric(date[1], 2, 2)
        && numeric(date[2], 4, 4)
        && numeric(time[0], 1, 2)
        && numeric(time[1], 2, 2)
        && numeric(time[2], 2, 2)
}

fn lerp_records(prev: &[Value], next: &[Value], k: f64) -> Vec<Option<Value>> {
    prev.iter()
        .zip(next)
        .map(|(a, b)| match (a, b) {
            (Value::Number(a), Value::Number(b)) => Some(Value::Number(a * (1.0 - k) + b * k)),
            (Value::Timestamp(a), Value::Timestamp(b)) => {
                let span_ms = (*b - *a).num_milliseconds() as f64;
                Some(Value::Timestamp(
                    *a + chrono::Duration::milliseconds((span_ms * k).round() as i64),
                ))
            }
            _ => None,
        })
        .collect()
}

// ============================================================================
// Legacy 8-bit text files
// ============================================================================

/// Read a Windows-1251 encoded text file
pub fn read_legacy_text(path: impl AsRef<Path>) -> DoseResult<String> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| DoseError::io(path, e))?;
    let (text, _, had_errors) = encoding_rs::WINDOWS_1251.decode(&bytes);
    if had_errors {
        log::warn!("{}: malformed Windows-1251 sequences replaced", path.display());
    }
    Ok(text.into_owned())
}

/// Write text as Windows-1251; unmappable characters fail the write
pub fn write_legacy_text(path: impl AsRef<Path>, text: &str) -> DoseResult<()> {
    let path = path.as_ref();
    let (bytes, _, had_errors) = encoding_rs::WINDOWS_1251.encode(text);
    if had_errors {
        return Err(DoseError::format(
            path.display().to_string(),
            0,
            "text is not representable in Windows-1251",
        ));
    }
    fs::write(path, &bytes).map_err(|e| DoseError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAS: &str = "# fuel assembly spans\n# generated\nRegZone\tCell\tPitch\n101\t1-1\t0\n102\t1-1\t1\n201\t1-2\t0\n";

    #[test]
    fn test_header_and_types() {
        let table = TypedTable::parse("fas", "Cell\tZone\nA1\t101\n").unwrap();
        assert_eq!(table.fields(), &["Cell".to_string(), "Zone".to_string()]);
        assert_eq!(table.column_types(), &[ColumnType::Text, ColumnType::Number]);
        assert_eq!(table.find_field_index("Cell").unwrap(), 0);
        assert_eq!(table.records()[0][1], Value::Number(101.0));
    }

    #[test]
    fn test_comments_skipped_and_zone_index() {
        let table = TypedTable::parse("fas", FAS).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.contains_zone(102).unwrap());
        assert!(!table.contains_zone(999).unwrap());
        let rec = table.zone_record(201).unwrap().unwrap();
        assert_eq!(rec[1], Value::Text("1-2".into()));
        assert!(table.zone_record(5).unwrap().is_none());
    }

    #[test]
    fn test_first_line_is_data_without_header() {
        let table = TypedTable::parse("raw", "1.5\t2\n3\t4e2\n").unwrap();
        assert!(table.fields().is_empty());
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[1][1], Value::Number(400.0));
        assert_eq!(table.find_field_index(1usize).unwrap(), 1);
        assert!(table.find_field_index(2usize).is_err());
        assert!(matches!(table.find_field_index("t"), Err(DoseError::Field(_))));
    }

    #[test]
    fn test_timestamp_column() {
        let text = "t\tN(W)\n1.02.2024 10:00:00\t0\n01.02.2024 12:30:15\t1000\n";
        let table = TypedTable::parse("hist", text).unwrap();
        assert_eq!(table.column_types()[0], ColumnType::Timestamp);
        let t = table.records()[1][0].as_timestamp().unwrap();
        assert_eq!(t.format(TIME_FORMAT).to_string(), "01.02.2024 12:30:15");
    }

    #[test]
    fn test_type_mismatch_reports_line() {
        let text = "# c\nCell\tPitch\nA\t1\nB\tx\n";
        match TypedTable::parse("bad.txt", text) {
            Err(DoseError::Format { file, line, .. }) => {
                assert_eq!(file, "bad.txt");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_too_many_values() {
        let err = TypedTable::parse("t", "A\tB\n1\t2\t3\n").unwrap_err();
        assert!(err.to_string().contains("2 fields but 3 data values"));
    }

    #[test]
    fn test_unparseable_field() {
        let err = TypedTable::parse("t", "A\tB\n1\tfoo bar\n").unwrap_err();
        assert!(err.to_string().contains("error parsing foo bar"));
    }

    #[test]
    fn test_number_pattern() {
        for ok in ["1", "-1", "+.5", "3.25", "1e5", "2.5E-03", "007"] {
            assert!(is_number(ok), "{}", ok);
        }
        for bad in ["", "1.", ".", "e5", "1e", "1-1", "nan", "inf", "1.2.3"] {
            assert!(!is_number(bad), "{}", bad);
        }
    }

    #[test]
    fn test_interpolate_by_field() {
        let mut table = TypedTable::parse("t", "x\ty\tname\n2\t20\tb\n0\t0\ta\n").unwrap();
        let rec = table.interpolate_by_field("x", &Value::Number(0.5)).unwrap();
        assert_eq!(rec[0], Some(Value::Number(0.5)));
        assert_eq!(rec[1], Some(Value::Number(5.0)));
        assert_eq!(rec[2], None);
    }

    #[test]
    fn test_interpolation_boundary_identity() {
        let mut table = TypedTable::parse("t", "x\ty\n0.1\t0.7\n0.3\t1.9\n").unwrap();
        let low = table.interpolate_by_field("x", &Value::Number(0.1)).unwrap();
        let high = table.interpolate_by_field("x", &Value::Number(0.3)).unwrap();
        assert_eq!(low, vec![Some(Value::Number(0.1)), Some(Value::Number(0.7))]);
        assert_eq!(high, vec![Some(Value::Number(0.3)), Some(Value::Number(1.9))]);
    }

    #[test]
    fn test_interpolate_on_string_field_fails() {
        let mut table = TypedTable::parse("t", "x\tname\n1\ta\n2\tb\n").unwrap();
        let err = table.interpolate_by_field("name", &Value::Number(1.0)).unwrap_err();
        assert!(matches!(err, DoseError::Field(_)));
    }

    #[test]
    fn test_interpolate_by_rec_no_clamps() {
        let table = TypedTable::parse("t", "x\n0\n10\n20\n").unwrap();
        assert_eq!(table.interpolate_by_rec_no(0.5).unwrap()[0], Some(Value::Number(5.0)));
        assert_eq!(table.interpolate_by_rec_no(-3.0).unwrap()[0], Some(Value::Number(0.0)));
        assert_eq!(table.interpolate_by_rec_no(7.0).unwrap()[0], Some(Value::Number(20.0)));
    }

    #[test]
    fn test_get_item_by_field_and_sort() {
        let mut table = TypedTable::parse("eff", "Channel\tEff\n12\t0.5\n7\t0.25\n").unwrap();
        let rec = table
            .get_item_by_field("Channel", &Value::Number(7.0))
            .unwrap()
            .unwrap();
        assert_eq!(rec[1], Value::Number(0.25));
        assert!(table
            .get_item_by_field("Channel", &Value::Number(8.0))
            .unwrap()
            .is_none());

        table.sort_by_field("Channel").unwrap();
        assert_eq!(table.records()[0][0], Value::Number(7.0));
    }

    #[test]
    fn test_records_have_constant_width() {
        let table = TypedTable::parse("fas", FAS).unwrap();
        for rec in table.records() {
            assert_eq!(rec.len(), table.column_types().len());
            for (value, ty) in rec.iter().zip(table.column_types()) {
                assert_eq!(value.column_type(), *ty);
            }
        }
        let err = TypedTable::parse("t", "A\tB\n1\t2\n3\n").unwrap_err();
        assert!(matches!(err, DoseError::Format { line: 3, .. }));
    }

    #[test]
    fn test_legacy_text_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("STA00000001");
        write_legacy_text(&path, "Параметры\nEMES 1.0E+06\n").unwrap();
        let bytes = fs::read(&path).unwrap();
        // one byte per Cyrillic letter
        assert_eq!(bytes.len(), "Параметры\nEMES 1.0E+06\n".chars().count());
        assert_eq!(read_legacy_text(&path).unwrap(), "Параметры\nEMES 1.0E+06\n");
    }
}
