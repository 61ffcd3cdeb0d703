//! Plain-text run report sent when a run has been processed.

use seqrun_protocol::{IndexMetric, MetricsSummary, OverallMetrics, SummaryRow};
use std::{fmt::Write, path::Path};

const READ_FIELDS: [&str; 5] = ["Level", "Yield", "Aligned%", "Error Rate%", "%>=Q30"];
const LANE_FIELDS: [&str; 7] = [
    "Lane",
    "Read",
    "Density(k/mm2)",
    "Cluster PF%",
    "%>=Q30",
    "Aligned%",
    "Error%",
];
const INDEX_FIELDS: [&str; 4] = ["Sample", "SampleName", "Index", "Counts"];

fn table<'a, R: 'a>(
    rows: impl IntoIterator<Item = &'a R>,
    fields: &[&str],
    width: usize,
    cell: impl Fn(&R, &str) -> String,
) -> String {
    let mut out = String::new();
    for field in fields {
        let _ = write!(out, "{field:<width$}");
    }
    out.push('\n');
    for row in rows {
        for field in fields {
            let _ = write!(out, "{:<width$}", cell(row, field));
        }
        out.push('\n');
    }
    out
}

fn summary_cell(row: &SummaryRow, field: &str) -> String {
    row.get(field).unwrap_or_default().to_string()
}

fn index_cell(metric: &IndexMetric, field: &str) -> String {
    match field {
        "Sample" => metric.sample.clone(),
        "SampleName" => metric.sample_name.clone(),
        "Index" => metric.index.clone(),
        _ => metric.counts.to_string(),
    }
}

pub fn clustering_stats(overall: &OverallMetrics) -> String {
    format!(
        "Clustering Stats: \n\n\
         Cluster Density: {:.2} k/mm2\n\
         Cluster Density (PF): {:.2} k/mm2\n\
         Number of Clusters: {}\n\
         Number of Clusters (PF): {}\n\
         Percentage Clusters (PF): {:.2}%\n\
         Percentage PhiX Aligned: {:.2}%\n\
         Error Rate: {:.2}%\n",
        overall.cluster_density,
        overall.cluster_density_pf,
        overall.clusters,
        overall.clusters_pf,
        overall.percent_pf,
        overall.percent_phix_aligned,
        overall.error_rate,
    )
}

pub fn web_link(web_loc: &str, output_dir: &Path) -> String {
    let output = output_dir.display().to_string();
    format!(
        "http://{}/{}/",
        web_loc.trim_end_matches('/'),
        output.trim_start_matches('/')
    )
}

/// Subject and body of the `Processed <run>` notification.
pub fn format_run_report(
    run_name: &str,
    metrics: &MetricsSummary,
    output_dir: &Path,
    web_loc: &str,
    warnings: &[String],
) -> (String, String) {
    let mut body = clustering_stats(&metrics.overall);
    body.push_str("\n\nRead Level Summary: \n\n");
    body.push_str(&table(&metrics.read_summary, &READ_FIELDS, 15, summary_cell));
    body.push_str("\n\nLane Summary: \n\n");
    body.push_str(&table(&metrics.lane_summary, &LANE_FIELDS, 17, summary_cell));
    if !metrics.index_metrics.is_empty() {
        body.push_str("\n\nIndex Summary: \n\n");
        body.push_str(&table(&metrics.index_metrics, &INDEX_FIELDS, 25, index_cell));
    }
    if !warnings.is_empty() {
        body.push_str("\n\nWarnings: \n\n");
        for warning in warnings {
            let _ = writeln!(body, "* {warning}");
        }
    }
    let _ = write!(
        body,
        "\n\n\nOutput directory is {}\n{}\n",
        output_dir.display(),
        web_link(web_loc, output_dir)
    );
    (format!("Processed {run_name}"), body)
}
