use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use seqrun::{
    Pipeline, RunOptions, Scheduler, Settings,
    notify::RecordingNotifier,
    registry::MemoryRunRegistry,
    sink::Compression as SinkCompression,
    run_dir::{PIPELINE_COMPLETE, RunStatus, SEQUENCER_COMPLETE, run_status},
    tools::{BASE_MASK_PAIRED_UMI, DemuxRequest, ToolError, ToolRunner, UmiMode},
    umi::RAW_DATA_DIR,
    upload::Uploader,
};
use serde_json::Value;
use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const RUN_NAME: &str = "160105_M03295_0042_000000000-ABCDE";
const OUTPUT_NAME: &str = "160105_M03295_0042_UMI_panel";

const SHEET: &str = "[Header]
IEMFileVersion,4
Investigator Name,Jane Doe
Experiment Name,2016Jan05_UMI_panel
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

const SUMMARY: &str = "# Version: v1.0.11
Level\tYield\tAligned%\tError Rate%\t%>=Q30
Read 1\t3.1\t1.20\t0.51\t92.1
Non-indexed\t6.1\t1.18\t0.61\t90.2
Total\t6.3\t1.18\t0.61\t90.0

#Per Lane/Read
Lane\tRead\tDensity(k/mm2)\tDensity PF\tCluster PF%\tReads\tReads PF
1\t1\t1000 +/- 20\t900 +/- 18\t90.0 +/- 1\t2000\t1500
";

const INDEX: &str = "# Index summary
Lane,Tile,Read,Index,Sample,Project,Count
1,1101,1,ATCACGAC,1,ProjA,600
1,1101,1,ACAGTGGT,2,ProjA,400
1,1101,2,ACAGTGGT,2,ProjA,400
";

const SAMPLES: [(&str, usize); 2] = [("liver", 1), ("kidney", 2)];
const READS_PER_SAMPLE: usize = 3;

fn write_gz_fastq(path: &Path, records: &[(String, &str)]) {
    let mut gz = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    for (header, seq) in records {
        write!(gz, "@{header}\n{seq}\n+\n{}\n", "I".repeat(seq.len())).unwrap();
    }
    gz.finish().unwrap();
}

fn read_gz(path: &Path) -> String {
    let mut text = String::new();
    MultiGzDecoder::new(fs::File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

/// Writes what bcl2fastq and the InterOp tools would have produced.
#[derive(Clone, Default)]
struct FakeTools {
    requests: Arc<Mutex<Vec<DemuxRequest>>>,
}

impl ToolRunner for FakeTools {
    fn demultiplex(&self, request: &DemuxRequest) -> Result<(), ToolError> {
        self.requests.lock().unwrap().push(request.clone());
        for (sample, number) in SAMPLES {
            let dir = request.output_dir.join("ProjA").join(sample);
            fs::create_dir_all(&dir).unwrap();
            for (read, sequence) in [("R1", "ACGTACGT"), ("R2", "GATTACAGATTA"), ("R3", "TTGGCCAA")] {
                let mate = &read[1..];
                let records: Vec<(String, &str)> = (0..READS_PER_SAMPLE)
                    .map(|i| (format!("M03295:42:FC:1:1101:{i}:{number} {mate}:N:0:1"), sequence))
                    .collect();
                write_gz_fastq(&dir.join(format!("{sample}_S{number}_{read}_001.fastq.gz")), &records);
            }
        }
        Ok(())
    }

    fn summarize_run(&self, _run_dir: &Path, dest: &Path) -> Result<(), ToolError> {
        fs::write(dest, SUMMARY).unwrap();
        Ok(())
    }

    fn summarize_index(&self, _index_bin: &Path, dest: &Path) -> Result<(), ToolError> {
        fs::write(dest, INDEX).unwrap();
        Ok(())
    }
}

struct AlwaysUploads;

impl Uploader for AlwaysUploads {
    fn sync(&self, _local_dir: &Path, _destination: &str) -> Option<i32> {
        Some(0)
    }
}

fn settings(root: &Path) -> Settings {
    serde_json::from_value(serde_json::json!({
        "run_directory": root,
        "umi_workers": 2,
        "tools": {"bcl2fastq": "bcl2fastq", "summary": "summary", "interopcsv": "interop"},
        "upload": {"s3folder": "s3://bucket/runs/"},
        "web_loc": "seq.lab.org"
    }))
    .unwrap()
}

fn finished_run(root: &Path) -> PathBuf {
    let run = root.join(RUN_NAME);
    fs::create_dir_all(run.join("InterOp")).unwrap();
    fs::write(run.join(SEQUENCER_COMPLETE), "").unwrap();
    fs::write(run.join("InterOp/IndexMetricsOut.bin"), [0u8; 4]).unwrap();
    fs::write(run.join("SampleSheet.csv"), SHEET).unwrap();
    run
}

#[test]
fn umi_run_is_demultiplexed_tagged_and_registered() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path();
    let run = finished_run(root);
    let tools = FakeTools::default();
    let notifier = RecordingNotifier::new();
    let registry = MemoryRunRegistry::new();
    let pipeline = Pipeline::new(settings(root), tools.clone())
        .with_notifier(notifier.clone())
        .with_uploader(AlwaysUploads)
        .with_registry(registry.clone());
    let options = RunOptions {
        upload: true,
        ..Default::default()
    };
    let scheduler = Scheduler::new(pipeline, options);

    let summary = scheduler.run_iteration();
    assert_eq!(summary.processed, vec![run.clone()]);
    assert!(summary.failed.is_empty());
    assert_eq!(run_status(&run), RunStatus::Done);
    assert!(run.join(PIPELINE_COMPLETE).is_file());

    let requests = tools.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].umi, UmiMode::Paired);
    let args = requests[0].arguments();
    let mask_at = args.iter().position(|a| a == "--use-bases-mask").unwrap();
    assert_eq!(args[mask_at + 1], BASE_MASK_PAIRED_UMI);

    let output = root.join(OUTPUT_NAME);
    for (sample, number) in SAMPLES {
        let dir = output.join("ProjA").join(sample);
        for (mate, read_tag) in [("R1", "1:N:0:1"), ("R2", "3:N:0:1")] {
            let text = read_gz(&dir.join(format!("{sample}_{mate}_UMI_001.fastq.gz")));
            let headers: Vec<&str> = text.lines().step_by(4).collect();
            assert_eq!(headers.len(), READS_PER_SAMPLE);
            for (i, header) in headers.iter().enumerate() {
                assert_eq!(
                    *header,
                    format!("@M03295:42:FC:1:1101:{i}:{number}:GATTACAGATTA {read_tag}")
                );
            }
        }
        for read in ["R1", "R2", "R3"] {
            let name = format!("{sample}_S{number}_{read}_001.fastq.gz");
            assert!(dir.join(RAW_DATA_DIR).join(&name).is_file());
            assert!(!dir.join(&name).exists());
        }
    }

    let details: Value =
        serde_json::from_str(&fs::read_to_string(output.join("run_details.json")).unwrap())
            .unwrap();
    assert_eq!(details["run"], OUTPUT_NAME);
    assert_eq!(details["Number of Clusters (PF)"], 1500);
    assert_eq!(details["samples"][0]["Counts"], 600);
    assert_eq!(details["samples"][1]["Counts"], 400);
    assert_eq!(details["index_metrics"][2]["Sample"], "Unknown");
    assert_eq!(details["index_metrics"][2]["Counts"], 500);
    for copied in ["SampleSheet.csv", "SAV_summary.tsv", "index_summary.csv"] {
        assert!(output.join(copied).is_file(), "{copied} not copied");
    }

    assert_eq!(
        notifier.subjects(),
        vec![
            format!("Processed {RUN_NAME}"),
            format!("Created {OUTPUT_NAME} in db"),
        ]
    );
    let (_, report_body) = &notifier.sent()[0];
    let link = format!(
        "http://seq.lab.org/{}/",
        output.display().to_string().trim_start_matches('/')
    );
    assert!(report_body.contains(&link));

    // A finished run is not picked up again.
    assert!(scheduler.run_iteration().processed.is_empty());
    assert_eq!(registry.runs().len(), 1);
}

#[test]
fn reprocessing_a_run_does_not_register_it_twice() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path();
    let run = finished_run(root);
    let notifier = RecordingNotifier::new();
    let registry = MemoryRunRegistry::new();
    let pipeline = Pipeline::new(settings(root), FakeTools::default())
        .with_notifier(notifier.clone())
        .with_uploader(AlwaysUploads)
        .with_registry(registry.clone())
        .with_compression(SinkCompression::External(vec![
            "gzip".to_string(),
            "-c".to_string(),
        ]));
    let scheduler = Scheduler::new(
        pipeline,
        RunOptions {
            upload: true,
            ..Default::default()
        },
    );

    let first = scheduler.run_once(&run).unwrap();
    assert!(!first.registration.unwrap().already_existed);
    let merged = root.join(OUTPUT_NAME).join("ProjA/kidney/kidney_R2_UMI_001.fastq.gz");
    assert!(read_gz(&merged).starts_with("@M03295:42:FC:1:1101:0:2:GATTACAGATTA 3:N:0:1\n"));

    let second = scheduler.run_once(&run).unwrap();
    assert!(second.registration.unwrap().already_existed);
    assert_eq!(registry.runs().len(), 1);
    assert_eq!(
        notifier.subjects().last().unwrap(),
        &format!("Run {OUTPUT_NAME} already in db")
    );
}
