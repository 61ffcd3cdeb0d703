//! Undetermined-barcode diagnostics: ranking the barcodes that failed to
//! match a sample, and checking for bleed-through from Illumina adapters.

use crate::{
    fastq::{FastqRecord, FastqStream},
    metrics::{MetricsError, index_counts_by_sequence},
    umi::UmiError,
};
use serde::Serialize;
use std::{cmp::Ordering, collections::HashMap, path::Path};

pub const DEFAULT_RANK_COUNT: usize = 15;
/// Barcodes below this share of all reads are left out of the report.
pub const MIN_READ_PERCENT: f64 = 0.05;

/// Illumina i7 adapter indices.
pub const I7_BARCODES: [(&str, &str); 24] = [
    ("A701", "ATCACGAC"),
    ("A702", "ACAGTGGT"),
    ("A703", "CAGATCCA"),
    ("A704", "ACAAACGG"),
    ("A705", "ACCCAGCA"),
    ("A706", "AACCCCTC"),
    ("A707", "CCCAACCT"),
    ("A708", "CACCACAC"),
    ("A709", "GAAACCCA"),
    ("A710", "TGTGACCA"),
    ("A711", "AGGGTCAA"),
    ("A712", "AGGAGTGG"),
    ("D701", "ATTACTCG"),
    ("D702", "TCCGGAGA"),
    ("D703", "CGCTCATT"),
    ("D704", "GAGATTCC"),
    ("D705", "ATTCAGAA"),
    ("D706", "GAATTCGT"),
    ("D707", "CTGAAGCT"),
    ("D708", "TAATGCGC"),
    ("D709", "CGGCTATG"),
    ("D710", "TCCGCGAA"),
    ("D711", "TCTCGCGC"),
    ("D712", "AGCGATAG"),
];

/// Illumina i5 adapter indices, forward and reverse-complement.
pub const I5_BARCODES: [(&str, [&str; 2]); 16] = [
    ("A501", ["TGAACCTT", "AAGGTTCA"]),
    ("A502", ["TGCTAAGT", "ACTTAGCA"]),
    ("A503", ["TGTTCTCT", "AGAGAACA"]),
    ("A504", ["TAAGACAC", "GTGTCTTA"]),
    ("A505", ["CTAATCGA", "TCGATTAG"]),
    ("A506", ["CTAGAACA", "TGTTCTAG"]),
    ("A507", ["TAAGTTCC", "GGAACTTA"]),
    ("A508", ["TAGACCTA", "TAGGTCTA"]),
    ("D501", ["TATAGCCT", "AGGCTATA"]),
    ("D502", ["ATAGAGGC", "GCCTCTAT"]),
    ("D503", ["CCTATCCT", "AGGATAGG"]),
    ("D504", ["GGCTCTGA", "TCAGAGCC"]),
    ("D505", ["AGGCGAAG", "CTTCGCCT"]),
    ("D506", ["TAATCTTA", "TAAGATTA"]),
    ("D507", ["CAGGACGT", "ACGTCCTG"]),
    ("D508", ["GTACTGAC", "GTCAGTAC"]),
];

pub fn is_illumina_i7(sequence: &str) -> bool {
    I7_BARCODES.iter().any(|(_, s)| *s == sequence)
}

pub fn is_illumina_i5(sequence: &str) -> bool {
    I5_BARCODES
        .iter()
        .any(|(_, pair)| pair.iter().any(|s| *s == sequence))
}

/// Barcode of a demultiplexer header: the text after its last `:`.
pub fn header_barcode(record: &FastqRecord) -> &str {
    let header = record.suffix.as_deref().unwrap_or(record.name.as_str());
    header.rsplit(':').next().unwrap_or(header).trim()
}

/// Add the barcodes of every read in a gzip FASTQ file to `counts`.
pub fn count_barcodes(path: &Path, counts: &mut HashMap<String, u64>) -> Result<u64, UmiError> {
    let mut stream = FastqStream::open(path)?;
    let mut reads = 0;
    while let Some(record) = stream.next_record()? {
        *counts.entry(header_barcode(&record).to_string()).or_default() += 1;
        reads += 1;
    }
    Ok(reads)
}

/// The `top` most frequent barcodes, most frequent first; ties are broken by
/// barcode so the listing is stable.
pub fn rank_barcodes(counts: &HashMap<String, u64>, top: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top);
    ranked
}

/// Number of differing positions; `None` for sequences of different length.
pub fn hamming(a: &str, b: &str) -> Option<usize> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.bytes().zip(b.bytes()).filter(|(x, y)| x != y).count())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BleedthroughRow {
    pub barcode: String,
    pub percent_reads: f64,
    /// Closest non-identical sample sheet barcode.
    pub min_distance: Option<usize>,
    pub in_sample_sheet: bool,
    pub illumina_i7: bool,
    pub illumina_i5: bool,
}

impl BleedthroughRow {
    pub fn to_tsv(&self) -> String {
        let distance = self
            .min_distance
            .map(|d| d.to_string())
            .unwrap_or_else(|| "NA".to_string());
        format!(
            "{}\t{:.2}\t{}\t{}\t{}\t{}",
            self.barcode,
            self.percent_reads,
            distance,
            self.in_sample_sheet,
            self.illumina_i7,
            self.illumina_i5
        )
    }
}

pub const BLEEDTHROUGH_HEADER: &str = "Barcode\t%Reads\tMinDist\tSampleSheet\tIlluminaI7\tIlluminaI5";

/// Combine the sample sheet barcodes of an index summary with undetermined
/// barcode counts. An undetermined count replaces the mapped count of the
/// same barcode.
pub fn bleedthrough_report(
    index_summary: &str,
    undetermined: &HashMap<String, u64>,
) -> Result<Vec<BleedthroughRow>, MetricsError> {
    let mapped = index_counts_by_sequence(index_summary)?;
    let mut all: HashMap<&str, f64> = mapped
        .iter()
        .map(|(k, v)| (k.as_str(), *v as f64))
        .collect();
    for (k, v) in undetermined {
        all.insert(k.as_str(), *v as f64);
    }
    let total: f64 = all.values().sum();
    if total <= 0.0 {
        return Ok(vec![]);
    }

    let mut rows: Vec<BleedthroughRow> = all
        .into_iter()
        .map(|(barcode, count)| (barcode, count * 100.0 / total))
        .filter(|(_, percent)| *percent >= MIN_READ_PERCENT)
        .map(|(barcode, percent)| {
            let min_distance = mapped
                .keys()
                .filter_map(|m| hamming(barcode, m))
                .filter(|d| *d != 0)
                .min();
            let (i7, i5) = match barcode.split_once('+') {
                Some((i7, i5)) => (i7, Some(i5)),
                None => (barcode, None),
            };
            BleedthroughRow {
                barcode: barcode.to_string(),
                percent_reads: percent,
                min_distance,
                in_sample_sheet: mapped.contains_key(barcode),
                illumina_i7: is_illumina_i7(i7),
                illumina_i5: i5.is_some_and(is_illumina_i5),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.percent_reads
            .partial_cmp(&a.percent_reads)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.barcode.cmp(&b.barcode))
    });
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastq::test_support::write_gz_fastq;

    #[test]
    fn barcodes_come_from_last_header_field() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("Undetermined_S0_R1_001.fastq.gz");
        write_gz_fastq(
            &path,
            &[
                ("M00:1:FC:1:1:1:1 1:N:0:ATCACGAC+TGAACCTT", "A"),
                ("M00:1:FC:1:1:1:2 1:N:0:ATCACGAC+TGAACCTT", "A"),
                ("M00:1:FC:1:1:1:3 1:N:0:GGGGGGGG+TGAACCTT", "A"),
            ],
        );
        let mut counts = HashMap::new();
        assert_eq!(count_barcodes(&path, &mut counts).unwrap(), 3);
        assert_eq!(counts["ATCACGAC+TGAACCTT"], 2);
        assert_eq!(
            rank_barcodes(&counts, 1),
            vec![("ATCACGAC+TGAACCTT".to_string(), 2)]
        );
    }

    #[test]
    fn hamming_requires_equal_lengths() {
        assert_eq!(hamming("ACGT", "ACGA"), Some(1));
        assert_eq!(hamming("ACGT", "ACG"), None);
    }

    #[test]
    fn adapter_tables_match_both_i5_orientations() {
        assert!(is_illumina_i7("AGCGATAG"));
        assert!(is_illumina_i5("TGAACCTT"));
        assert!(is_illumina_i5("AAGGTTCA"));
        assert!(!is_illumina_i5("ATCACGAC"));
    }

    #[test]
    fn report_flags_bleedthrough_candidates() {
        let index = "# Index\n\
                     Lane,Tile,Read,Index,Sample,Project,Count\n\
                     1,1101,1,ATCACGAC+TGAACCTT,1,P,9000\n\
                     1,1101,2,ATCACGAC+TGAACCTT,1,P,9000\n";
        let undetermined: HashMap<String, u64> = [
            ("ACAGTGGT+TGAACCTT".to_string(), 990),
            ("NNNNNNNN+NNNNNNNN".to_string(), 9),
            ("TTTTTTTT+TTTTTTTT".to_string(), 1),
        ]
        .into_iter()
        .collect();
        let rows = bleedthrough_report(index, &undetermined).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].barcode, "ATCACGAC+TGAACCTT");
        assert!((rows[0].percent_reads - 90.0).abs() < 1e-9);
        assert!(rows[0].in_sample_sheet);
        assert_eq!(rows[0].min_distance, None);

        assert_eq!(rows[1].barcode, "ACAGTGGT+TGAACCTT");
        assert!(!rows[1].in_sample_sheet);
        assert!(rows[1].illumina_i7 && rows[1].illumina_i5);
        assert_eq!(rows[1].min_distance, Some(6));
        assert_eq!(rows[1].to_tsv(), "ACAGTGGT+TGAACCTT\t9.90\t6\tfalse\ttrue\ttrue");

        // 1 read in 10000 is below the reporting threshold
        assert!(rows.iter().all(|r| r.barcode != "TTTTTTTT+TTTTTTTT"));
    }
}
