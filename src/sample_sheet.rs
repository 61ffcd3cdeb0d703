use chrono::{DateTime, Local, NaiveDate};
use csv::ReaderBuilder;
use seqrun_protocol::{ExperimentMetadata, SampleRecord};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const SAMPLE_SHEET_NAME: &str = "SampleSheet.csv";

const SAMPLE_ID_COLUMN: &str = "Sample_ID";
const SAMPLE_NAME_COLUMN: &str = "Sample_Name";
const SAMPLE_PROJECT_COLUMN: &str = "Sample_Project";


#[derive(Debug, Error)]
pub enum SampleSheetError {
    #[error("{SAMPLE_SHEET_NAME} is absent and no csv files are present in '{0}', cannot demultiplex")]
    Missing(PathBuf),
    #[error("{SAMPLE_SHEET_NAME} is absent and too many csv files are present in '{dir}': {candidates:?}")]
    Ambiguous {
        dir: PathBuf,
        candidates: Vec<String>,
    },
    #[error("sample sheet has no '{0}' section")]
    MissingSection(&'static str),
    #[error("sample sheet header has no '{0}' entry")]
    MissingField(&'static str),
    #[error("sample sheet data section has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("sample id '{0}' appears more than once in the sample sheet")]
    DuplicateSample(String),
    #[error("could not parse sample sheet data section: {0}")]
    Csv(#[from] csv::Error),
    #[error("could not access sample sheet '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Locate the run's sample sheet. A single stray `*.csv` is adopted by
/// copying it to `SampleSheet.csv`; zero or several candidates are an error.
pub fn resolve_sample_sheet(run_dir: &Path) -> Result<PathBuf, SampleSheetError> {
    let sheet = run_dir.join(SAMPLE_SHEET_NAME);
    if sheet.is_file() {
        return Ok(sheet);
    }
    let io_err = |source| SampleSheetError::Io {
        path: run_dir.to_path_buf(),
        source,
    };
    let mut candidates = vec![];
    for entry in fs::read_dir(run_dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_csv = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && path.is_file() {
            candidates.push(path);
        }
    }
    candidates.sort();
    match candidates.as_slice() {
        [] => Err(SampleSheetError::Missing(run_dir.to_path_buf())),
        [only] => {
            info!(
                "Using '{}' as {SAMPLE_SHEET_NAME} for '{}'",
                only.display(),
                run_dir.display()
            );
            fs::copy(only, &sheet).map_err(|source| SampleSheetError::Io {
                path: sheet.clone(),
                source,
            })?;
            Ok(sheet)
        }
        many => Err(SampleSheetError::Ambiguous {
            dir: run_dir.to_path_buf(),
            candidates: many
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        }),
    }
}

/// Read and parse a sample sheet file; the file's creation time is the date
/// fallback when the experiment id carries no parsable date.
pub fn read_sample_sheet(path: &Path) -> Result<ExperimentMetadata, SampleSheetError> {
    let io_err = |source| SampleSheetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let text = fs::read_to_string(path).map_err(io_err)?;
    let meta = fs::metadata(path).map_err(io_err)?;
    let created = meta.created().or_else(|_| meta.modified()).map_err(io_err)?;
    let fallback = DateTime::<Local>::from(created)
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string();
    parse_sample_sheet(&text, &fallback)
}

fn find_section(lines: &[&str], name: &'static str) -> Result<usize, SampleSheetError> {
    let bracketed = format!("[{name}]");
    lines
        .iter()
        .position(|l| l.contains(&bracketed))
        .or_else(|| lines.iter().position(|l| l.contains(name)))
        .ok_or(SampleSheetError::MissingSection(name))
}

fn header_value(line: &str) -> String {
    line.trim_end()
        .split(',')
        .nth(1)
        .unwrap_or_default()
        .replace(' ', "_")
}

fn slice_between<'a>(lines: &'a [&'a str], start: usize, end: usize) -> &'a [&'a str] {
    lines.get(start..end).unwrap_or(&[])
}

/// Experiment ids start with a `2016Jan05`-style date unless they use the
/// `prefix%suffix` convention.
pub fn experiment_date(experiment: &str) -> Option<String> {
    if experiment.contains('%') {
        return None;
    }
    let token = experiment.split('_').next()?;
    NaiveDate::parse_from_str(token, "%Y%b%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

pub fn parse_sample_sheet(
    text: &str,
    fallback_date: &str,
) -> Result<ExperimentMetadata, SampleSheetError> {
    let lines: Vec<&str> = text.lines().collect();
    let header = find_section(&lines, "Header")?;
    let reads = find_section(&lines, "Reads")?;
    let settings = find_section(&lines, "Settings")?;
    let data = find_section(&lines, "Data")?;

    let mut investigator = None;
    let mut experiment = None;
    let mut description = String::new();
    let mut annotations: Option<Vec<String>> = None;
    for line in slice_between(&lines, header, reads) {
        if line.starts_with("Investigator") {
            investigator = Some(header_value(line));
        } else if line.starts_with("Experiment") {
            experiment = Some(header_value(line));
        } else if line.starts_with("Description") {
            description = header_value(line);
        } else if line.starts_with("Annotations") {
            let keys = line.trim_end().split(',').nth(1).unwrap_or_default();
            annotations = Some(keys.split('|').map(str::to_string).collect());
        }
    }
    let experiment = experiment.ok_or(SampleSheetError::MissingField("Experiment"))?;
    let date = experiment_date(&experiment).unwrap_or_else(|| fallback_date.to_string());

    let read_text = slice_between(&lines, reads + 1, settings).join(" ");
    let read_lengths = read_text
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|token| token.parse::<u32>().ok())
        .collect();

    let data_text = slice_between(&lines, data + 1, lines.len()).join("\n");
    let samples = parse_data_section(&data_text, annotations.as_deref())?;

    Ok(ExperimentMetadata {
        investigator,
        experiment,
        description,
        date,
        annotations,
        read_lengths,
        samples,
    })
}

fn parse_data_section(
    text: &str,
    annotation_keys: Option<&[String]>,
) -> Result<Vec<SampleRecord>, SampleSheetError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut records = reader.records();
    let Some(columns) = records.next().transpose()? else {
        return Ok(vec![]);
    };
    let columns: Vec<String> = columns.iter().map(|c| c.trim().to_string()).collect();
    if !columns.iter().any(|c| c == SAMPLE_ID_COLUMN) {
        return Err(SampleSheetError::MissingColumn(SAMPLE_ID_COLUMN));
    }

    let mut samples = vec![];
    let mut seen = HashSet::new();
    for row in records {
        let row = row?;
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let values: Vec<&str> = row.iter().collect();
        // With annotations the last column holds pipe-separated values for the
        // annotation keys declared in the header.
        let (plain_columns, plain_values, annotations) = match annotation_keys {
            Some(keys) => {
                let n_cols = columns.len().saturating_sub(1);
                let n_vals = values.len().saturating_sub(1);
                let ann: BTreeMap<String, String> = keys
                    .iter()
                    .cloned()
                    .zip(
                        values
                            .last()
                            .copied()
                            .unwrap_or_default()
                            .split('|')
                            .map(str::to_string),
                    )
                    .collect();
                (&columns[..n_cols], &values[..n_vals], ann)
            }
            None => (&columns[..], &values[..], BTreeMap::new()),
        };

        let mut fields: BTreeMap<String, String> = plain_columns
            .iter()
            .cloned()
            .zip(plain_values.iter().map(|v| v.to_string()))
            .collect();
        let sample_id = fields.remove(SAMPLE_ID_COLUMN).unwrap_or_default();
        if !seen.insert(sample_id.clone()) {
            return Err(SampleSheetError::DuplicateSample(sample_id));
        }
        samples.push(SampleRecord {
            sample_id,
            sample_name: fields.remove(SAMPLE_NAME_COLUMN).unwrap_or_default(),
            sample_project: fields.remove(SAMPLE_PROJECT_COLUMN).unwrap_or_default(),
            fields,
            annotations,
            counts: None,
        });
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UMI_SHEET: &str = "[Header]
IEMFileVersion,4
Investigator Name,Jane Doe
Experiment Name,2016Jan05_UMI panel
Date,1/5/2016
Description,NuGEN UMI test
[Reads]
150
150

[Settings]
Adapter,AGATCGGAAGAGCACACGTCTGAACTCCAGTCA
[Data]
Sample_ID,Sample_Name,Sample_Plate,Sample_Well,I7_Index_ID,index,Sample_Project,Description
1,liver,,A01,A701,ATCACGAC,ProjA,
2,kidney,,B01,A702,ACAGTGGT,ProjA,
";

    #[test]
    fn parses_header_reads_and_samples() {
        let meta = parse_sample_sheet(UMI_SHEET, "2020-01-01T00:00:00").unwrap();
        assert_eq!(meta.investigator.as_deref(), Some("Jane_Doe"));
        assert_eq!(meta.experiment, "2016Jan05_UMI_panel");
        assert_eq!(meta.description, "NuGEN_UMI_test");
        assert_eq!(meta.date, "2016-01-05T00:00:00");
        assert_eq!(meta.read_lengths, vec![150, 150]);
        assert!(meta.is_umi());
        assert!(!meta.is_single_end());
        assert_eq!(meta.samples.len(), 2);
        assert_eq!(meta.samples[0].sample_id, "1");
        assert_eq!(meta.samples[0].sample_name, "liver");
        assert_eq!(meta.samples[0].sample_project, "ProjA");
        assert_eq!(meta.samples[1].fields["index"], "ACAGTGGT");
    }

    #[test]
    fn undated_experiment_falls_back_to_file_date() {
        let sheet = UMI_SHEET.replace("2016Jan05_UMI panel", "pilot_run");
        let meta = parse_sample_sheet(&sheet, "2020-02-03T04:05:06").unwrap();
        assert_eq!(meta.date, "2020-02-03T04:05:06");

        let munich = UMI_SHEET.replace("2016Jan05_UMI panel", "2016Jan05%batch1");
        let meta = parse_sample_sheet(&munich, "2020-02-03T04:05:06").unwrap();
        assert_eq!(meta.date, "2020-02-03T04:05:06");
    }

    #[test]
    fn annotations_are_split_from_last_column() {
        let sheet = "[Header]
Experiment Name,2017Mar02_ann
Description,rna
Annotations,tissue|donor
[Reads]
75
[Settings]
[Data]
Sample_ID,Sample_Name,Sample_Project,Annotations
S1,a,P,liver|d1
S2,b,P,lung|d2
";
        let meta = parse_sample_sheet(sheet, "x").unwrap();
        assert_eq!(
            meta.annotations,
            Some(vec!["tissue".to_string(), "donor".to_string()])
        );
        assert!(meta.is_single_end());
        assert_eq!(meta.samples[1].annotations["tissue"], "lung");
        assert_eq!(meta.samples[1].annotations["donor"], "d2");
        assert!(!meta.samples[1].fields.contains_key("Annotations"));
    }

    #[test]
    fn missing_data_section_is_reported() {
        let sheet = "[Header]\nExperiment Name,x\n[Reads]\n[Settings]\n";
        let err = parse_sample_sheet(sheet, "x").unwrap_err();
        assert!(matches!(err, SampleSheetError::MissingSection("Data")));
    }

    #[test]
    fn duplicate_sample_ids_are_rejected() {
        let sheet = UMI_SHEET.replace("2,kidney", "1,kidney");
        let err = parse_sample_sheet(&sheet, "x").unwrap_err();
        assert!(matches!(err, SampleSheetError::DuplicateSample(id) if id == "1"));
    }

    #[test]
    fn single_stray_csv_is_adopted() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("my_sheet.csv"), UMI_SHEET).unwrap();
        let sheet = resolve_sample_sheet(td.path()).unwrap();
        assert_eq!(sheet, td.path().join(SAMPLE_SHEET_NAME));
        assert!(sheet.is_file());
    }

    #[test]
    fn zero_or_many_csv_candidates_are_configuration_errors() {
        let td = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_sample_sheet(td.path()),
            Err(SampleSheetError::Missing(_))
        ));
        fs::write(td.path().join("a.csv"), "").unwrap();
        fs::write(td.path().join("b.csv"), "").unwrap();
        let err = resolve_sample_sheet(td.path()).unwrap_err();
        assert!(matches!(err, SampleSheetError::Ambiguous { candidates, .. } if candidates.len() == 2));
    }
}
