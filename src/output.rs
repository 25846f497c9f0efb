//! Tab-delimited dose-rate result files

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::info;

use crate::decay::DecayGrid;
use crate::dose::to_microsievert_per_hour;
use crate::error::{DoseError, DoseResult};

/// One column of dose rates [uSv/h] per zone and one row per decay time.
/// `rates` are in Sv/s.
pub fn render_dose_table(grid: &DecayGrid, rates: &BTreeMap<i64, Vec<f64>>) -> DoseResult<String> {
    let columns: Vec<(i64, Vec<f64>)> = rates
        .iter()
        .map(|(zone, r)| (*zone, to_microsievert_per_hour(r)))
        .collect();
    for (zone, col) in &columns {
        if col.len() != grid.len() {
            return Err(DoseError::Field(format!(
                "zone {} has {} dose rates for {} decay times",
                zone,
                col.len(),
                grid.len()
            )));
        }
    }

    let mut out = String::from("Hours");
    for (zone, _) in &columns {
        let _ = write!(out, "\t{}", zone);
    }
    out.push('\n');

    for (t, hours) in grid.hours().iter().enumerate() {
        let _ = write!(out, "{:.1}", hours);
        for (_, col) in &columns {
            let _ = write!(out, "\t{:.6e}", col[t]);
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn write_dose_table(
    path: impl AsRef<Path>,
    grid: &DecayGrid,
    rates: &BTreeMap<i64, Vec<f64>>,
) -> DoseResult<()> {
    let path = path.as_ref();
    let text = render_dose_table(grid, rates)?;
    fs::write(path, text).map_err(|e| DoseError::io(path, e))?;
    info!("{} saved", path.display());
    Ok(())
}

/// Read back a dose table: decay hours and zone -> rates [uSv/h]
pub fn read_dose_table(path: impl AsRef<Path>) -> DoseResult<(Vec<f64>, BTreeMap<i64, Vec<f64>>)> {
    let path = path.as_ref();
    let source = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| DoseError::io(path, e))?;
    let mut lines = text.lines().enumerate();

    let header = match lines.next() {
        Some((_, h)) => h,
        None => return Err(DoseError::format(source, 1, "empty dose table")),
    };
    let zones = header
        .split('\t')
        .skip(1)
        .map(|z| z.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DoseError::format(&source, 1, format!("bad zone header: {}", e)))?;

    let mut hours = Vec::new();
    let mut rates: BTreeMap<i64, Vec<f64>> = zones.iter().map(|z| (*z, Vec::new())).collect();
    for (i, line) in lines {
        let values = line
            .split('\t')
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DoseError::format(&source, i + 1, e.to_string()))?;
        if values.len() != zones.len() + 1 {
            return Err(DoseError::format(
                &source,
                i + 1,
                format!("{} values for {} zones", values.len() - 1, zones.len()),
            ));
        }
        hours.push(values[0]);
        for (zone, v) in zones.iter().zip(&values[1..]) {
            if let Some(col) = rates.get_mut(zone) {
                col.push(*v);
            }
        }
    }
    Ok((hours, rates))
}
