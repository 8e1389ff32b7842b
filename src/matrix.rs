//! Dual-layout feature matrix parsing
//!
//! Cohort expression matrices arrive as TSV in one of two orientations:
//! *sample-major* (header cell 0 is literally `sample`, one row per sample)
//! or *feature-major* (one row per gene, sample labels across the header).
//! Orientation is decided once per file from the header and dispatched as a
//! tagged enum; sample-major emits one record per row without buffering,
//! feature-major has to accumulate per-patient maps across the whole stream.

use crate::config::PanelConfig;
use crate::error::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::BufRead;

/// One normalized per-patient record produced by a matrix import.
///
/// Feature keys are canonical (uppercased, alias-resolved) at insertion, so
/// lookups never depend on the source file's casing.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub patient_barcode: String,
    pub cohort: String,
    pub features: BTreeMap<String, f64>,
}

/// The configured set of wanted features with its alias table.
#[derive(Debug, Clone)]
pub struct FeaturePanel {
    wanted: HashSet<String>,
    aliases: HashMap<String, String>,
}

impl FeaturePanel {
    pub fn new<I, S>(genes: I, aliases: &HashMap<String, String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let aliases: HashMap<String, String> = aliases
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.to_ascii_uppercase()))
            .collect();
        // Canonicalize the wanted set through the alias table too, so a
        // panel configured with the legacy name matches the canonical one.
        let wanted = genes
            .into_iter()
            .map(|g| canonical_feature(g.as_ref(), &aliases))
            .collect();
        Self { wanted, aliases }
    }

    pub fn from_config(config: &PanelConfig) -> Self {
        Self::new(&config.genes, &config.aliases)
    }

    /// Resolves a raw header/row token to its canonical feature name, or
    /// `None` when it is not in the wanted set.
    pub fn resolve(&self, raw: &str) -> Option<String> {
        let canonical = canonical_feature(raw, &self.aliases);
        self.wanted.contains(&canonical).then_some(canonical)
    }

    pub fn is_empty(&self) -> bool {
        self.wanted.is_empty()
    }
}

fn canonical_feature(raw: &str, aliases: &HashMap<String, String>) -> String {
    let upper = clean_feature(raw.trim()).to_ascii_uppercase();
    aliases.get(&upper).cloned().unwrap_or(upper)
}

/// Strips an annotation suffix (`TP53|7157` → `TP53`). A leading pipe is
/// kept verbatim.
pub fn clean_feature(raw: &str) -> &str {
    match raw.find('|') {
        Some(i) if i > 0 => &raw[..i],
        _ => raw,
    }
}

/// Derives a patient-level barcode from a raw sample/column label.
///
/// A label with at least three hyphen-delimited segments keeps exactly the
/// first three (discarding sample/aliquot suffixes); otherwise a label of
/// twelve or more characters is truncated to twelve and uppercased;
/// anything shorter is uppercased whole.
pub fn normalize_barcode(label: &str) -> String {
    let label = label.trim();
    let segments: Vec<&str> = label.split('-').filter(|s| !s.is_empty()).collect();
    if segments.len() >= 3 {
        return format!("{}-{}-{}", segments[0], segments[1], segments[2]);
    }
    // Truncation counts chars, not bytes; labels are not guaranteed ASCII.
    label
        .chars()
        .take(12)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Parses a matrix cell as a locale-invariant decimal. Empty, `NA` (any
/// case), and unparseable cells are absent, never zero and never an error.
fn parse_cell(cell: &str) -> Option<f64> {
    let token = cell.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("NA") {
        return None;
    }
    token.parse::<f64>().ok()
}

/// Matrix orientation, detected solely from the header's first cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    SampleMajor,
    FeatureMajor,
}

impl MatrixLayout {
    pub fn detect(first_header_cell: &str) -> Self {
        if first_header_cell.trim().eq_ignore_ascii_case("sample") {
            MatrixLayout::SampleMajor
        } else {
            MatrixLayout::FeatureMajor
        }
    }
}

/// Lazy, single-pass sequence of [`PatientRecord`]s parsed from a TSV
/// stream.
///
/// Sample-major input yields one record per data row as the stream is read.
/// Feature-major input is consumed up front into per-barcode accumulators
/// (O(patients × wanted features) memory) and then drained, since one
/// patient's features span every row of the file.
pub struct MatrixRecords<R> {
    cohort: String,
    inner: Inner<R>,
}

enum Inner<R> {
    Done,
    SampleMajor {
        lines: std::io::Lines<R>,
        /// (column index, canonical feature) for wanted columns only.
        columns: Vec<(usize, String)>,
    },
    FeatureMajor {
        drain: std::collections::btree_map::IntoIter<String, BTreeMap<String, f64>>,
    },
}

impl<R: BufRead> MatrixRecords<R> {
    /// Reads the header, detects the orientation, and prepares the record
    /// stream. A header with fewer than two columns, or a panel matching
    /// nothing, yields an empty sequence rather than an error.
    pub fn new(mut reader: R, cohort: &str, panel: &FeaturePanel) -> Result<Self> {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            return Ok(Self::done(cohort));
        }
        let header: Vec<&str> = header_line.trim_end_matches(['\r', '\n']).split('\t').collect();
        if header.len() < 2 {
            return Ok(Self::done(cohort));
        }

        let inner = match MatrixLayout::detect(header[0]) {
            MatrixLayout::SampleMajor => {
                let columns: Vec<(usize, String)> = header
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter_map(|(i, h)| panel.resolve(h).map(|f| (i, f)))
                    .collect();
                if columns.is_empty() {
                    Inner::Done
                } else {
                    Inner::SampleMajor {
                        lines: reader.lines(),
                        columns,
                    }
                }
            }
            MatrixLayout::FeatureMajor => {
                let barcodes: Vec<String> =
                    header[1..].iter().map(|h| normalize_barcode(h)).collect();
                let accumulated = accumulate_feature_major(reader, &barcodes, panel)?;
                Inner::FeatureMajor {
                    drain: accumulated.into_iter(),
                }
            }
        };

        Ok(Self {
            cohort: cohort.to_string(),
            inner,
        })
    }

    fn done(cohort: &str) -> Self {
        Self {
            cohort: cohort.to_string(),
            inner: Inner::Done,
        }
    }
}

fn accumulate_feature_major<R: BufRead>(
    reader: R,
    barcodes: &[String],
    panel: &FeaturePanel,
) -> Result<BTreeMap<String, BTreeMap<String, f64>>> {
    let mut accumulator: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for line in reader.lines() {
        let line = line?;
        let cells: Vec<&str> = line.split('\t').collect();
        if cells.len() < 2 {
            continue;
        }
        let Some(feature) = panel.resolve(cells[0]) else {
            continue;
        };
        for (i, cell) in cells.iter().enumerate().skip(1) {
            // Ragged rows and surplus columns are missing data, not errors.
            let Some(barcode) = barcodes.get(i - 1) else {
                break;
            };
            if let Some(value) = parse_cell(cell) {
                accumulator
                    .entry(barcode.clone())
                    .or_default()
                    .insert(feature.clone(), value);
            }
        }
    }
    Ok(accumulator)
}

impl<R: BufRead> Iterator for MatrixRecords<R> {
    type Item = Result<PatientRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let cohort = &self.cohort;
        // The loop only breaks when the sample-major stream is exhausted or
        // errors; both end the iteration for good.
        let last = loop {
            match &mut self.inner {
                Inner::Done => return None,
                Inner::SampleMajor { lines, columns } => {
                    let line = match lines.next() {
                        None => break None,
                        Some(Err(e)) => break Some(Err(e.into())),
                        Some(Ok(line)) => line,
                    };
                    let cells: Vec<&str> = line.split('\t').collect();
                    if cells.len() < 2 {
                        continue;
                    }
                    let mut features = BTreeMap::new();
                    for (idx, feature) in columns.iter() {
                        if let Some(value) = cells.get(*idx).and_then(|c| parse_cell(c)) {
                            features.insert(feature.clone(), value);
                        }
                    }
                    if features.is_empty() {
                        continue;
                    }
                    return Some(Ok(PatientRecord {
                        patient_barcode: normalize_barcode(cells[0]),
                        cohort: cohort.clone(),
                        features,
                    }));
                }
                Inner::FeatureMajor { drain } => {
                    return drain.next().map(|(patient_barcode, features)| {
                        Ok(PatientRecord {
                            patient_barcode,
                            cohort: cohort.clone(),
                            features,
                        })
                    });
                }
            }
        };
        self.inner = Inner::Done;
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn panel(genes: &[&str]) -> FeaturePanel {
        let aliases = HashMap::from([("IL8".to_string(), "CXCL8".to_string())]);
        FeaturePanel::new(genes.iter().copied(), &aliases)
    }

    fn parse(tsv: &str, genes: &[&str]) -> Vec<PatientRecord> {
        MatrixRecords::new(Cursor::new(tsv.to_string()), "gbm", &panel(genes))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn barcode_keeps_first_three_segments() {
        assert_eq!(normalize_barcode("TCGA-AB-1234-01A-11R"), "TCGA-AB-1234");
        assert_eq!(normalize_barcode("TCGA-AB-1234"), "TCGA-AB-1234");
    }

    #[test]
    fn barcode_truncates_unhyphenated_labels() {
        assert_eq!(normalize_barcode("tcga.ab.1234.01"), "TCGA.AB.1234");
        assert_eq!(normalize_barcode("short"), "SHORT");
    }

    #[test]
    fn barcode_truncation_handles_multibyte_labels() {
        // The 12th char is non-ASCII; truncation must not split it.
        assert_eq!(normalize_barcode("AAAAAAAAAAAÀBC"), "AAAAAAAAAAAÀ");
        assert_eq!(normalize_barcode("ÀÀÀ"), "ÀÀÀ");
    }

    #[test]
    fn feature_cleanup_and_alias() {
        let p = panel(&["TP53", "IL8"]);
        assert_eq!(p.resolve("TP53|7157").as_deref(), Some("TP53"));
        assert_eq!(p.resolve("il8").as_deref(), Some("CXCL8"));
        assert_eq!(p.resolve("CXCL8").as_deref(), Some("CXCL8"));
        assert_eq!(p.resolve("BRCA1"), None);
    }

    #[test]
    fn layout_detection_is_case_insensitive() {
        assert_eq!(MatrixLayout::detect("Sample"), MatrixLayout::SampleMajor);
        assert_eq!(MatrixLayout::detect("sample"), MatrixLayout::SampleMajor);
        assert_eq!(MatrixLayout::detect("Gene"), MatrixLayout::FeatureMajor);
    }

    #[test]
    fn sample_major_emits_one_record_per_row() {
        let records = parse(
            "sample\tTP53\tIL8\nTCGA-AB-1234-01\t1.5\t2.0\n",
            &["TP53", "CXCL8"],
        );
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.patient_barcode, "TCGA-AB-1234");
        assert_eq!(record.cohort, "gbm");
        assert_eq!(record.features.get("TP53"), Some(&1.5));
        assert_eq!(record.features.get("CXCL8"), Some(&2.0));
    }

    #[test]
    fn sample_major_skips_na_and_ragged_cells() {
        let records = parse(
            "sample\tTP53\tCCL5\nTCGA-AA-0001-01\tNA\t3.0\nTCGA-AA-0002-01\t1.0\n",
            &["TP53", "CCL5"],
        );
        assert_eq!(records.len(), 2);
        assert!(!records[0].features.contains_key("TP53"));
        assert_eq!(records[0].features.get("CCL5"), Some(&3.0));
        // Second row is shorter than the header: trailing column is absent.
        assert_eq!(records[1].features.get("TP53"), Some(&1.0));
        assert!(!records[1].features.contains_key("CCL5"));
    }

    #[test]
    fn sample_major_row_with_no_values_is_dropped() {
        let records = parse("sample\tTP53\nTCGA-AA-0001-01\tNA\n", &["TP53"]);
        assert!(records.is_empty());
    }

    #[test]
    fn feature_major_accumulates_across_rows() {
        let records = parse(
            "Gene\tTCGA-AA-0001-01\tTCGA-AA-0002-01\nTP53\t1.0\tNA\nIL8\t0.5\t0.7\nBRCA1\t9.0\t9.0\n",
            &["TP53", "CXCL8"],
        );
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.patient_barcode, "TCGA-AA-0001");
        assert_eq!(first.features.get("TP53"), Some(&1.0));
        assert_eq!(first.features.get("CXCL8"), Some(&0.5));
        // NA means absent for this patient, not zero.
        let second = &records[1];
        assert_eq!(second.patient_barcode, "TCGA-AA-0002");
        assert!(!second.features.contains_key("TP53"));
        assert_eq!(second.features.get("CXCL8"), Some(&0.7));
    }

    #[test]
    fn feature_major_unwanted_rows_have_no_effect() {
        let records = parse(
            "Gene\tTCGA-AA-0001-01\nBRCA1\t5.0\nEGFR\t2.0\n",
            &["TP53"],
        );
        assert!(records.is_empty());
    }

    #[test]
    fn duplicate_features_take_last_seen_value() {
        let records = parse(
            "Gene\tTCGA-AA-0001-01\nTP53\t1.0\nTP53\t2.0\n",
            &["TP53"],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].features.get("TP53"), Some(&2.0));
    }

    #[test]
    fn short_header_yields_no_records() {
        assert!(parse("sample\n", &["TP53"]).is_empty());
        assert!(parse("", &["TP53"]).is_empty());
    }

    #[test]
    fn feature_major_ignores_surplus_value_columns() {
        let records = parse(
            "Gene\tTCGA-AA-0001-01\nTP53\t1.0\t2.0\t3.0\n",
            &["TP53"],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].features.get("TP53"), Some(&1.0));
    }
}
