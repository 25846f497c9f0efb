//! Core-monitoring algorithms
//!
//! An algorithm is one MCU calculation of the whole core: the relative
//! fission energy released in every fuel assembly segment and the reaction
//! rate seen by every in-core detector. Algorithms are keyed by
//! `(name, assembly count)`; exactly one of them is the reference that the
//! detector effectiveness of the others is scaled from.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{DoseError, DoseResult};
use crate::fin::{self, AssemblyZones, DetectorZones, FinScan};
use crate::schema::{AlgorithmEntry, EffectivenessEntry};
use crate::table::{TypedTable, Value};

pub type AlgorithmKey = (String, u32);

/// What to do when a non-reference algorithm reports a detector channel
/// the reference algorithm does not have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingChannelPolicy {
    /// Log a warning and leave the effectiveness unset
    #[default]
    Skip,
    /// Abort the load with a field error
    Fatal,
}

/// Per-segment fission energy share of one fuel assembly
#[derive(Debug, Clone, Default, Serialize)]
pub struct FuelAssembly {
    pub cell: String,
    pub shares: BTreeMap<usize, f64>,
}

/// In-core detector of one algorithm
#[derive(Debug, Clone, Serialize)]
pub struct Detector {
    pub channel: i64,
    pub r3: f64,                     // raw reaction rate
    pub effectiveness: Option<f64>,  // [A/W]
}

#[derive(Debug, Clone)]
pub struct Algorithm {
    pub name: String,
    pub assemblies: u32,
    pub hcrit: f64,
    pub reference: bool,
    pub fuel: BTreeMap<String, FuelAssembly>,
    pub detectors: BTreeMap<i64, Detector>,
    /// Sum of the raw fission tallies before normalisation
    pub total_fissions: f64,
}

impl Algorithm {
    /// Build an algorithm from a scanned report and normalise its shares
    pub fn from_scan(entry: &AlgorithmEntry, scan: FinScan) -> Self {
        let mut fuel: BTreeMap<String, FuelAssembly> = BTreeMap::new();
        for rec in scan.fissions {
            let fa = fuel.entry(rec.cell.clone()).or_insert_with(|| FuelAssembly {
                cell: rec.cell.clone(),
                shares: BTreeMap::new(),
            });
            fa.shares.insert(rec.segment, rec.mean);
        }

        let detectors = scan
            .detectors
            .into_iter()
            .map(|d| {
                (
                    d.channel,
                    Detector {
                        channel: d.channel,
                        r3: d.mean,
                        effectiveness: None,
                    },
                )
            })
            .collect();

        let total_fissions: f64 = fuel.values().flat_map(|fa| fa.shares.values()).sum();
        if total_fissions > 0.0 {
            for share in fuel.values_mut().flat_map(|fa| fa.shares.values_mut()) {
                *share /= total_fissions;
            }
        } else {
            warn!("Algorithm {} {} FAs has no fission energy", entry.name, entry.assemblies);
        }

        Self {
            name: entry.name.clone(),
            assemblies: entry.assemblies,
            hcrit: entry.hcrit,
            reference: entry.reference,
            fuel,
            detectors,
            total_fissions,
        }
    }

    /// Read the algorithm's FIN report from `fin_dir`
    pub fn load(
        entry: &AlgorithmEntry,
        fin_dir: &Path,
        assemblies: &AssemblyZones,
        detectors: &DetectorZones,
    ) -> DoseResult<Self> {
        let path = fin_dir.join(&entry.fin_file);
        let scan = fin::scan_file(&path, assemblies, detectors)?;
        let alg = Self::from_scan(entry, scan);
        info!(
            "{} read: {} {} FAs, {} detectors, {} fissions",
            path.display(),
            alg.name,
            alg.fuel.len(),
            alg.detectors.len(),
            alg.total_fissions
        );
        Ok(alg)
    }

    pub fn key(&self) -> AlgorithmKey {
        (self.name.clone(), self.assemblies)
    }

    /// Normalised fission share of one assembly segment
    pub fn share(&self, cell: &str, segment: usize) -> Option<f64> {
        self.fuel.get(cell)?.shares.get(&segment).copied()
    }

    pub fn share_sum(&self) -> f64 {
        self.fuel.values().flat_map(|fa| fa.shares.values()).sum()
    }

    /// Highest segment index present, if any
    pub fn max_segment(&self) -> Option<usize> {
        self.fuel
            .values()
            .filter_map(|fa| fa.shares.keys().next_back().copied())
            .max()
    }
}

fn describe(key: &AlgorithmKey) -> String {
    format!("{} {} FAs", key.0, key.1)
}

/// All algorithms of a run with detector effectiveness resolved
#[derive(Debug, Clone)]
pub struct AlgorithmModel {
    algorithms: BTreeMap<AlgorithmKey, Algorithm>,
    reference: AlgorithmKey,
    segment_count: usize,
}

impl AlgorithmModel {
    /// Resolve effectiveness against the reference algorithm.
    ///
    /// `effectiveness` is the reference table with `Channel` and `Eff`
    /// fields. A reference channel absent from it is logged and left unset.
    pub fn new(
        algorithms: Vec<Algorithm>,
        effectiveness: &TypedTable,
        policy: MissingChannelPolicy,
    ) -> DoseResult<Self> {
        let mut algorithms: BTreeMap<AlgorithmKey, Algorithm> =
            algorithms.into_iter().map(|a| (a.key(), a)).collect();

        let reference = algorithms
            .iter()
            .find(|(_, a)| a.reference)
            .map(|(k, _)| k.clone())
            .ok_or(DoseError::MissingReference)?;
        info!("Reference algorithm {} found", describe(&reference));

        let ref_detectors = {
            let ref_alg = algorithms
                .get_mut(&reference)
                .ok_or(DoseError::MissingReference)?;
            for det in ref_alg.detectors.values_mut() {
                let entry: Option<EffectivenessEntry> = effectiveness
                    .find_decoded("Channel", &Value::Number(det.channel as f64))?;
                match entry {
                    Some(e) => det.effectiveness = Some(e.effectiveness),
                    None => warn!(
                        "Channel {} was not found in {}",
                        det.channel,
                        effectiveness.source()
                    ),
                }
            }
            ref_alg.detectors.clone()
        };

        for (key, alg) in algorithms.iter_mut().filter(|(_, a)| !a.reference) {
            debug!("Non-reference algorithm {} found", describe(key));
            for (channel, det) in alg.detectors.iter_mut() {
                let derived = ref_detectors
                    .get(channel)
                    .and_then(|r| r.effectiveness.map(|eff| det.r3 / r.r3 * eff));
                match (derived, ref_detectors.contains_key(channel), policy) {
                    (Some(eff), _, _) => det.effectiveness = Some(eff),
                    (None, false, MissingChannelPolicy::Fatal) => {
                        return Err(DoseError::Field(format!(
                            "channel {} of {} is missing from the reference algorithm",
                            channel,
                            describe(key)
                        )))
                    }
                    (None, false, MissingChannelPolicy::Skip) => warn!(
                        "Channel {} of {} is missing from the reference algorithm",
                        channel,
                        describe(key)
                    ),
                    (None, true, _) => debug!(
                        "Channel {} of {} has no reference effectiveness",
                        channel,
                        describe(key)
                    ),
                }
            }
        }

        let segment_count = algorithms
            .values()
            .filter_map(Algorithm::max_segment)
            .max()
            .map_or(0, |m| m + 1);

        info!(
            "{} algorithms loaded, {} segments per FA",
            algorithms.len(),
            segment_count
        );
        Ok(Self {
            algorithms,
            reference,
            segment_count,
        })
    }

    /// Load every algorithm listed in `list`
    pub fn load(
        list: &TypedTable,
        fin_dir: &Path,
        assemblies: &AssemblyZones,
        detectors: &DetectorZones,
        effectiveness: &TypedTable,
        policy: MissingChannelPolicy,
    ) -> DoseResult<Self> {
        let algorithms = list
            .decode_all::<AlgorithmEntry>()?
            .iter()
            .map(|entry| Algorithm::load(entry, fin_dir, assemblies, detectors))
            .collect::<DoseResult<Vec<_>>>()?;
        Self::new(algorithms, effectiveness, policy)
    }

    pub fn get(&self, key: &AlgorithmKey) -> Option<&Algorithm> {
        self.algorithms.get(key)
    }

    pub fn reference(&self) -> &Algorithm {
        // present by construction
        &self.algorithms[&self.reference]
    }

    pub fn reference_key(&self) -> &AlgorithmKey {
        &self.reference
    }

    /// Number of axial segments per assembly across every algorithm
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AlgorithmKey, &Algorithm)> {
        self.algorithms.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fin::{DetectorRecord, FissionRecord};

    fn entry(name: &str, reference: bool) -> AlgorithmEntry {
        AlgorithmEntry {
            name: name.to_string(),
            hcrit: 300.0,
            assemblies: 2,
            fin_file: format!("{}.FIN", name),
            reference,
        }
    }

    fn fission(cell: &str, segment: usize, mean: f64) -> FissionRecord {
        FissionRecord {
            zone: 0,
            cell: cell.to_string(),
            segment,
            mean,
            stdev: 0.01,
        }
    }

    fn detector(channel: i64, mean: f64) -> DetectorRecord {
        DetectorRecord {
            zone: 0,
            channel,
            mean,
            stdev: 0.01,
        }
    }

    fn algorithm(name: &str, reference: bool, r3: &[(i64, f64)]) -> Algorithm {
        let scan = FinScan {
            fissions: vec![
                fission("1-1", 0, 1.0),
                fission("1-1", 1, 3.0),
                fission("2-1", 0, 2.0),
                fission("2-1", 1, 2.0),
            ],
            detectors: r3.iter().map(|&(c, m)| detector(c, m)).collect(),
            ..FinScan::default()
        };
        Algorithm::from_scan(&entry(name, reference), scan)
    }

    fn eff_table() -> TypedTable {
        TypedTable::parse("detectors_eff.txt", "Channel\tEff\n7\t0.5\n8\t1.0\n").unwrap()
    }

    #[test]
    fn test_shares_are_normalised() {
        let alg = algorithm("P+M", true, &[]);
        assert_eq!(alg.total_fissions, 8.0);
        assert!((alg.share_sum() - 1.0).abs() < 1e-9);
        assert_eq!(alg.share("1-1", 1), Some(3.0 / 8.0));
        assert_eq!(alg.share("3-3", 0), None);
        assert_eq!(alg.max_segment(), Some(1));
    }

    #[test]
    fn test_effectiveness_derivation() {
        let reference = algorithm("P+M", true, &[(7, 2.0), (8, 4.0), (9, 1.0)]);
        let other = algorithm("P+M+C", false, &[(7, 3.0), (8, 2.0)]);
        let model =
            AlgorithmModel::new(vec![reference, other], &eff_table(), MissingChannelPolicy::Skip)
                .unwrap();

        let r = model.reference();
        assert_eq!(r.detectors[&7].effectiveness, Some(0.5));
        // channel 9 is not in the effectiveness table
        assert_eq!(r.detectors[&9].effectiveness, None);

        let o = model.get(&("P+M+C".to_string(), 2)).unwrap();
        assert_eq!(o.detectors[&7].effectiveness, Some(3.0 / 2.0 * 0.5));
        assert_eq!(o.detectors[&8].effectiveness, Some(2.0 / 4.0 * 1.0));
        assert_eq!(model.segment_count(), 2);
    }

    #[test]
    fn test_missing_channel_policy() {
        let make = || {
            vec![
                algorithm("P+M", true, &[(7, 2.0)]),
                algorithm("P+M+C", false, &[(7, 3.0), (8, 2.0)]),
            ]
        };
        let model = AlgorithmModel::new(make(), &eff_table(), MissingChannelPolicy::Skip).unwrap();
        let o = model.get(&("P+M+C".to_string(), 2)).unwrap();
        assert_eq!(o.detectors[&8].effectiveness, None);

        let err = AlgorithmModel::new(make(), &eff_table(), MissingChannelPolicy::Fatal).unwrap_err();
        assert!(matches!(err, DoseError::Field(_)));
    }

    #[test]
    fn test_reference_required() {
        let err = AlgorithmModel::new(
            vec![algorithm("P+M", false, &[])],
            &eff_table(),
            MissingChannelPolicy::Skip,
        )
        .unwrap_err();
        assert!(matches!(err, DoseError::MissingReference));
    }
}
