//! Machine-readable records shared between the seqrun pipeline, its
//! `run_details.json` artifact and the run registry.
//!
//! Field names on the wire follow the sample sheet and metrics column names
//! (`Sample_ID`, `Cluster Density`, ...) so downstream consumers of the JSON
//! artifact can keep addressing them the way they appear in the source files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN_SAMPLE: &str = "Unknown";

/// One row of the `[Data]` section of a sample sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(rename = "Sample_ID")]
    pub sample_id: String,
    #[serde(rename = "Sample_Name", default)]
    pub sample_name: String,
    #[serde(rename = "Sample_Project", default)]
    pub sample_project: String,
    /// Remaining sheet columns (index sequences, plate wells, ...).
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Filled in from the index metrics once the run has been summarized.
    #[serde(rename = "Counts", default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    #[serde(default)]
    pub investigator: Option<String>,
    pub experiment: String,
    #[serde(default)]
    pub description: String,
    /// ISO-8601 local timestamp.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<String>>,
    pub read_lengths: Vec<u32>,
    pub samples: Vec<SampleRecord>,
}

impl ExperimentMetadata {
    /// UMI processing is requested through the description or experiment id.
    pub fn is_umi(&self) -> bool {
        self.description.to_ascii_lowercase().contains("umi")
            || self.experiment.to_ascii_lowercase().contains("umi")
    }

    pub fn is_single_end(&self) -> bool {
        self.read_lengths.len() == 1
    }

    pub fn sample(&self, sample_id: &str) -> Option<&SampleRecord> {
        self.samples.iter().find(|s| s.sample_id == sample_id)
    }
}

/// A row of the read-level or lane-level summary table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SummaryRow(pub BTreeMap<String, String>);

impl SummaryRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SummaryRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        SummaryRow(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetric {
    #[serde(rename = "Sample")]
    pub sample: String,
    #[serde(rename = "SampleName", default)]
    pub sample_name: String,
    #[serde(rename = "Index")]
    pub index: String,
    /// Signed: the `Unknown` bucket goes negative when the sheet and the
    /// instrument disagree.
    #[serde(rename = "Counts")]
    pub counts: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallMetrics {
    #[serde(rename = "Cluster Density")]
    pub cluster_density: f64,
    #[serde(rename = "Cluster Density (PF)")]
    pub cluster_density_pf: f64,
    #[serde(rename = "Number of Clusters")]
    pub clusters: u64,
    #[serde(rename = "Number of Clusters (PF)")]
    pub clusters_pf: u64,
    #[serde(rename = "Percentage Clusters (PF)")]
    pub percent_pf: f64,
    #[serde(rename = "Percentage PhiX Aligned")]
    pub percent_phix_aligned: f64,
    #[serde(rename = "Error%")]
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub read_summary: Vec<SummaryRow>,
    pub lane_summary: Vec<SummaryRow>,
    /// Empty when the run produced no index metrics.
    pub index_metrics: Vec<IndexMetric>,
    pub overall: OverallMetrics,
}

impl MetricsSummary {
    pub fn unknown_bucket(&self) -> Option<&IndexMetric> {
        self.index_metrics
            .iter()
            .find(|m| m.sample == UNKNOWN_SAMPLE && m.index == UNKNOWN_SAMPLE)
    }

    /// Human-readable consistency problems worth reporting with the run.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = vec![];
        if let Some(unknown) = self.unknown_bucket() {
            if unknown.counts < 0 {
                out.push(format!(
                    "Sample counts exceed PF clusters by {}; the sample sheet does not match the run",
                    -unknown.counts
                ));
            }
        }
        out
    }
}

/// Content of `run_details.json`: the experiment metadata merged with the
/// run metrics, keyed by the output directory name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub experiment: ExperimentMetadata,
    pub run: String,
    pub read_summary: Vec<SummaryRow>,
    pub lane_summary: Vec<SummaryRow>,
    #[serde(default)]
    pub index_metrics: Vec<IndexMetric>,
    #[serde(flatten)]
    pub overall: OverallMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(description: &str, experiment: &str, reads: &[u32]) -> ExperimentMetadata {
        ExperimentMetadata {
            experiment: experiment.to_string(),
            description: description.to_string(),
            read_lengths: reads.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn umi_detection_is_case_insensitive_on_both_fields() {
        assert!(metadata("NuGEN_UMI_panel", "2016Jan05_exp", &[150, 150]).is_umi());
        assert!(metadata("", "2016Jan05_Umi_exp", &[150]).is_umi());
        assert!(!metadata("plain run", "2016Jan05_exp", &[150]).is_umi());
    }

    #[test]
    fn single_end_follows_read_lengths() {
        assert!(metadata("", "x", &[75]).is_single_end());
        assert!(!metadata("", "x", &[150, 150]).is_single_end());
    }

    #[test]
    fn negative_unknown_bucket_produces_warning() {
        let summary = MetricsSummary {
            index_metrics: vec![IndexMetric {
                sample: UNKNOWN_SAMPLE.to_string(),
                sample_name: UNKNOWN_SAMPLE.to_string(),
                index: UNKNOWN_SAMPLE.to_string(),
                counts: -12,
            }],
            ..Default::default()
        };
        let warnings = summary.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("12"));
    }

    #[test]
    fn run_details_flatten_uses_source_column_names() {
        let details = RunDetails {
            experiment: ExperimentMetadata {
                experiment: "2016Jan05_demo".to_string(),
                samples: vec![SampleRecord {
                    sample_id: "1".to_string(),
                    sample_name: "liver".to_string(),
                    counts: Some(10),
                    ..Default::default()
                }],
                ..Default::default()
            },
            run: "160105_M00_demo".to_string(),
            overall: OverallMetrics {
                clusters: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["run"], "160105_M00_demo");
        assert_eq!(value["Number of Clusters"], 100);
        assert_eq!(value["samples"][0]["Sample_ID"], "1");
        assert_eq!(value["samples"][0]["Counts"], 10);
    }
}
