//! Parsing of the instrument's run summary (tab separated) and index summary
//! (comma separated) outputs.
//!
//! Everything here is a pure function over text already read from disk.

use seqrun_protocol::{
    ExperimentMetadata, IndexMetric, MetricsSummary, OverallMetrics, SummaryRow, UNKNOWN_SAMPLE,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::warn;

const READ_SECTION_MARKER: &str = "# Version";
const LANE_SECTION_MARKER: &str = "#Per";
const NON_INDEXED_LEVEL: &str = "Non-indexed";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("run summary has no '{0}' marker line")]
    MissingMarker(&'static str),
    #[error("run summary has no header row after '{0}'")]
    MissingHeader(&'static str),
    #[error("lane summary row has no '{0}' column")]
    MissingColumn(String),
    #[error("could not parse '{value}' in column '{column}' as a number")]
    InvalidNumber { column: String, value: String },
    #[error("lane summary has no rows")]
    EmptyLaneSummary,
    #[error("total cluster count is zero; percentage passing filter is undefined")]
    ZeroClusters,
    #[error("expected exactly one '{NON_INDEXED_LEVEL}' read summary row, found {0}")]
    NonIndexedRows(usize),
    #[error("index summary line {line} has {found} fields, expected at least 7")]
    ShortIndexLine { line: usize, found: usize },
    #[error("invalid cluster count '{value}' on index summary line {line}")]
    InvalidCount { line: usize, value: String },
}

fn find_marker(lines: &[&str], marker: &'static str) -> Result<usize, MetricsError> {
    lines
        .iter()
        .position(|l| l.contains(marker))
        .ok_or(MetricsError::MissingMarker(marker))
}

fn parse_table(lines: &[&str], marker: &'static str) -> Result<Vec<SummaryRow>, MetricsError> {
    let mut iter = lines.iter().map(|l| l.trim_end()).filter(|l| !l.is_empty());
    let header = iter.next().ok_or(MetricsError::MissingHeader(marker))?;
    let fields: Vec<&str> = header.split('\t').collect();
    Ok(iter
        .map(|line| {
            fields
                .iter()
                .copied()
                .zip(line.split('\t'))
                .collect::<SummaryRow>()
        })
        .collect())
}

/// Split the run summary into its read-level and lane-level tables.
pub fn parse_summary(text: &str) -> Result<(Vec<SummaryRow>, Vec<SummaryRow>), MetricsError> {
    let lines: Vec<&str> = text.lines().collect();
    let version = find_marker(&lines, READ_SECTION_MARKER)?;
    let lane = find_marker(&lines, LANE_SECTION_MARKER)?;
    let read_lines = lines.get(version + 1..lane).unwrap_or(&[]);
    let read_summary = parse_table(read_lines, READ_SECTION_MARKER)?;
    let lane_summary = parse_table(&lines[lane + 1..], LANE_SECTION_MARKER)?;
    Ok((read_summary, lane_summary))
}

fn parse_number(column: &str, raw: &str) -> Result<f64, MetricsError> {
    // Values may carry a spread, e.g. "234 +/- 12"
    let value = raw.split("+/-").next().unwrap_or_default().trim();
    value.parse::<f64>().map_err(|_| MetricsError::InvalidNumber {
        column: column.to_string(),
        value: raw.to_string(),
    })
}

fn per_lane_values(lane_summary: &[SummaryRow], field: &str) -> Result<Vec<f64>, MetricsError> {
    if lane_summary.is_empty() {
        return Err(MetricsError::EmptyLaneSummary);
    }
    // One value per lane; lanes repeat once per read and the last row wins.
    let mut by_lane: BTreeMap<String, f64> = BTreeMap::new();
    for row in lane_summary {
        let lane = row
            .get("Lane")
            .ok_or_else(|| MetricsError::MissingColumn("Lane".to_string()))?;
        let raw = row
            .get(field)
            .ok_or_else(|| MetricsError::MissingColumn(field.to_string()))?;
        by_lane.insert(lane.to_string(), parse_number(field, raw)?);
    }
    Ok(by_lane.into_values().collect())
}

fn lane_mean(lane_summary: &[SummaryRow], field: &str) -> Result<f64, MetricsError> {
    let values = per_lane_values(lane_summary, field)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

fn lane_sum(lane_summary: &[SummaryRow], field: &str) -> Result<f64, MetricsError> {
    Ok(per_lane_values(lane_summary, field)?.iter().sum())
}

pub fn percent_pf(clusters_pf: u64, clusters: u64) -> Result<f64, MetricsError> {
    if clusters == 0 {
        return Err(MetricsError::ZeroClusters);
    }
    Ok(clusters_pf as f64 * 100.0 / clusters as f64)
}

pub fn overall_metrics(
    read_summary: &[SummaryRow],
    lane_summary: &[SummaryRow],
) -> Result<OverallMetrics, MetricsError> {
    let non_indexed: Vec<&SummaryRow> = read_summary
        .iter()
        .filter(|r| r.get("Level") == Some(NON_INDEXED_LEVEL))
        .collect();
    let [non_indexed] = non_indexed.as_slice() else {
        return Err(MetricsError::NonIndexedRows(non_indexed.len()));
    };
    let read_value = |column: &str| -> Result<f64, MetricsError> {
        let raw = non_indexed
            .get(column)
            .ok_or_else(|| MetricsError::MissingColumn(column.to_string()))?;
        parse_number(column, raw)
    };

    let clusters = lane_sum(lane_summary, "Reads")? as u64;
    let clusters_pf = lane_sum(lane_summary, "Reads PF")? as u64;
    Ok(OverallMetrics {
        cluster_density: lane_mean(lane_summary, "Density(k/mm2)")?,
        cluster_density_pf: lane_mean(lane_summary, "Density PF")?,
        clusters,
        clusters_pf,
        percent_pf: percent_pf(clusters_pf, clusters)?,
        percent_phix_aligned: read_value("Aligned%")?,
        error_rate: read_value("Error Rate%")?,
    })
}

struct IndexLine<'a> {
    read: &'a str,
    index: &'a str,
    sample: &'a str,
    count: i64,
}

fn index_lines(text: &str) -> impl Iterator<Item = Result<IndexLine<'_>, MetricsError>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.starts_with('#') && !l.starts_with('L'))
        .map(|(n, l)| {
            let fields: Vec<&str> = l.trim_end().split(',').collect();
            if fields.len() < 7 {
                return Err(MetricsError::ShortIndexLine {
                    line: n + 1,
                    found: fields.len(),
                });
            }
            let count = fields[6]
                .trim()
                .parse::<i64>()
                .map_err(|_| MetricsError::InvalidCount {
                    line: n + 1,
                    value: fields[6].to_string(),
                })?;
            Ok(IndexLine {
                read: fields[2].trim(),
                index: fields[3].trim(),
                sample: fields[4].trim(),
                count,
            })
        })
}

/// Cluster counts per index sequence. Only read 1 is counted, otherwise
/// paired runs would count every cluster twice.
pub fn index_counts_by_sequence(text: &str) -> Result<HashMap<String, i64>, MetricsError> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for line in index_lines(text) {
        let line = line?;
        if line.read == "1" {
            *counts.entry(line.index.to_string()).or_default() += line.count;
        }
    }
    Ok(counts)
}

/// Per-sample index metrics, sorted numerically by sample id when every id is
/// a number and lexically otherwise. Sample names are filled in later.
pub fn parse_index_summary(text: &str) -> Result<Vec<IndexMetric>, MetricsError> {
    let mut sample_index: HashMap<String, String> = HashMap::new();
    for line in index_lines(text) {
        let line = line?;
        sample_index.insert(line.sample.to_string(), line.index.to_string());
    }
    let counts = index_counts_by_sequence(text)?;
    let mut metrics: Vec<IndexMetric> = sample_index
        .into_iter()
        .map(|(sample, index)| IndexMetric {
            counts: counts.get(&index).copied().unwrap_or(0),
            sample,
            sample_name: String::new(),
            index,
        })
        .collect();
    if metrics.iter().all(|m| m.sample.parse::<i64>().is_ok()) {
        metrics.sort_by_key(|m| m.sample.parse::<i64>().unwrap_or_default());
    } else {
        metrics.sort_by(|a, b| a.sample.cmp(&b.sample));
    }
    Ok(metrics)
}

/// Build the full summary for a run. `index_text` is `None` when the run has
/// no index metrics; the `Unknown` bucket is only added when it has some.
pub fn summarize_metrics(
    summary_text: &str,
    index_text: Option<&str>,
) -> Result<MetricsSummary, MetricsError> {
    let (read_summary, lane_summary) = parse_summary(summary_text)?;
    let overall = overall_metrics(&read_summary, &lane_summary)?;
    let mut index_metrics = match index_text {
        Some(text) => parse_index_summary(text)?,
        None => vec![],
    };
    if !index_metrics.is_empty() {
        let assigned: i64 = index_metrics.iter().map(|m| m.counts).sum();
        let unknown = overall.clusters_pf as i64 - assigned;
        if unknown < 0 {
            warn!(
                "Sample counts ({assigned}) exceed PF clusters ({}); check the sample sheet",
                overall.clusters_pf
            );
        }
        index_metrics.push(IndexMetric {
            sample: UNKNOWN_SAMPLE.to_string(),
            sample_name: String::new(),
            index: UNKNOWN_SAMPLE.to_string(),
            counts: unknown,
        });
    }
    Ok(MetricsSummary {
        read_summary,
        lane_summary,
        index_metrics,
        overall,
    })
}

/// Attach sample names from the sheet; ids the sheet does not know become
/// `Unknown`.
pub fn add_sample_names(index_metrics: &mut [IndexMetric], metadata: &ExperimentMetadata) {
    for metric in index_metrics.iter_mut() {
        metric.sample_name = metadata
            .sample(&metric.sample)
            .map(|s| s.sample_name.clone())
            .unwrap_or_else(|| UNKNOWN_SAMPLE.to_string());
    }
}

/// Copy per-sample counts into the experiment metadata. Samples missing from
/// the index metrics (a sheet corrected after the run) get zero.
pub fn apply_sample_counts(metadata: &mut ExperimentMetadata, index_metrics: &[IndexMetric]) {
    for sample in metadata.samples.iter_mut() {
        let counts = index_metrics
            .iter()
            .find(|m| m.sample_name == sample.sample_name)
            .map(|m| m.counts)
            .unwrap_or(0);
        sample.counts = Some(counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqrun_protocol::SampleRecord;

    const SUMMARY: &str = "Illumina run summary
# Version: v1.0.11
Level\tYield\tProjected Yield\tAligned%\tError Rate%\tIntensity C1\t%>=Q30
Read 1\t3.1\t3.1\t1.20\t0.51\t210\t92.1
Read 4\t3.0\t3.0\t1.15\t0.72\t190\t88.4
Non-indexed\t6.1\t6.1\t1.18\t0.61\t200\t90.2
Total\t6.3\t6.3\t1.18\t0.61\t200\t90.0

#Per Lane/Read
Lane\tRead\tDensity(k/mm2)\tDensity PF\tCluster PF%\tReads\tReads PF\t%>=Q30\tAligned%\tError%
1\t1\t1000 +/- 20\t900 +/- 18\t90.0 +/- 1\t20000\t18000\t92.1\t1.2\t0.5
1\t4\t1000 +/- 20\t900 +/- 18\t90.0 +/- 1\t20000\t18000\t88.4\t1.1\t0.7
2\t1\t1200 +/- 10\t1000 +/- 9\t83.3 +/- 1\t30000\t25000\t91.0\t1.2\t0.5
";

    const INDEX: &str = "# Index summary
Lane,Tile,Read,Index,Sample,Project,Count
1,1101,1,ATCACGAC,2,ProjA,400
1,1101,1,ACAGTGGT,1,ProjA,600
1,1101,2,ATCACGAC,2,ProjA,400
1,1102,1,ATCACGAC,2,ProjA,100
";

    #[test]
    fn summary_tables_are_split_on_markers() {
        let (reads, lanes) = parse_summary(SUMMARY).unwrap();
        assert_eq!(reads.len(), 4);
        assert_eq!(reads[2].get("Level"), Some("Non-indexed"));
        assert_eq!(lanes.len(), 3);
        assert_eq!(lanes[2].get("Reads PF"), Some("25000"));
    }

    #[test]
    fn overall_metrics_average_density_and_sum_clusters() {
        let (reads, lanes) = parse_summary(SUMMARY).unwrap();
        let overall = overall_metrics(&reads, &lanes).unwrap();
        assert_eq!(overall.cluster_density, 1100.0);
        assert_eq!(overall.cluster_density_pf, 950.0);
        assert_eq!(overall.clusters, 50000);
        assert_eq!(overall.clusters_pf, 43000);
        assert!((overall.percent_pf - 86.0).abs() < 1e-9);
        assert_eq!(overall.percent_phix_aligned, 1.18);
        assert_eq!(overall.error_rate, 0.61);
    }

    #[test]
    fn zero_total_clusters_is_an_error() {
        let text = SUMMARY
            .replace("\t20000\t18000\t", "\t0\t0\t")
            .replace("\t30000\t25000\t", "\t0\t0\t");
        let (reads, lanes) = parse_summary(&text).unwrap();
        assert!(matches!(
            overall_metrics(&reads, &lanes),
            Err(MetricsError::ZeroClusters)
        ));
        assert!(matches!(percent_pf(10, 0), Err(MetricsError::ZeroClusters)));
    }

    #[test]
    fn missing_non_indexed_row_is_fatal() {
        let text = SUMMARY.replace("Non-indexed", "Something");
        let (reads, lanes) = parse_summary(&text).unwrap();
        assert!(matches!(
            overall_metrics(&reads, &lanes),
            Err(MetricsError::NonIndexedRows(0))
        ));
    }

    #[test]
    fn missing_lane_marker_is_fatal() {
        let text = SUMMARY.replace("#Per Lane/Read", "");
        assert!(matches!(
            parse_summary(&text),
            Err(MetricsError::MissingMarker("#Per"))
        ));
    }

    #[test]
    fn index_counts_only_read_one_and_sort_numerically() {
        let metrics = parse_index_summary(INDEX).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].sample, "1");
        assert_eq!(metrics[0].counts, 600);
        assert_eq!(metrics[1].sample, "2");
        assert_eq!(metrics[1].index, "ATCACGAC");
        assert_eq!(metrics[1].counts, 500);
    }

    #[test]
    fn unknown_bucket_is_pf_minus_assigned() {
        let summary = summarize_metrics(SUMMARY, Some(INDEX)).unwrap();
        let unknown = summary.unknown_bucket().unwrap();
        assert_eq!(unknown.counts, 43000 - 1100);
        assert!(summary.warnings().is_empty());

        let without = summarize_metrics(SUMMARY, None).unwrap();
        assert!(without.index_metrics.is_empty());
    }

    #[test]
    fn negative_unknown_bucket_is_kept() {
        let index = INDEX.replace(",600", ",60000");
        let summary = summarize_metrics(SUMMARY, Some(&index)).unwrap();
        assert_eq!(summary.unknown_bucket().unwrap().counts, 43000 - 60500);
        assert_eq!(summary.warnings().len(), 1);
    }

    #[test]
    fn sample_names_and_counts_flow_into_metadata() {
        let mut metadata = ExperimentMetadata {
            samples: vec![
                SampleRecord {
                    sample_id: "1".to_string(),
                    sample_name: "liver".to_string(),
                    ..Default::default()
                },
                SampleRecord {
                    sample_id: "3".to_string(),
                    sample_name: "lung".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut summary = summarize_metrics(SUMMARY, Some(INDEX)).unwrap();
        add_sample_names(&mut summary.index_metrics, &metadata);
        assert_eq!(summary.index_metrics[0].sample_name, "liver");
        assert_eq!(summary.index_metrics[1].sample_name, UNKNOWN_SAMPLE);
        apply_sample_counts(&mut metadata, &summary.index_metrics);
        assert_eq!(metadata.samples[0].counts, Some(600));
        assert_eq!(metadata.samples[1].counts, Some(0));
    }
}
