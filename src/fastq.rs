//! Gzip FASTQ input and plain record output.

use crate::umi::UmiError;
use bio::io::fastq;
use flate2::read::MultiGzDecoder;
use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    /// Identifier up to the first whitespace.
    pub name: String,
    /// Everything after the identifier (Illumina read/filter/index tag).
    pub suffix: Option<String>,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
}

impl FastqRecord {
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(b"@")?;
        out.write_all(self.name.as_bytes())?;
        if let Some(suffix) = &self.suffix {
            out.write_all(b" ")?;
            out.write_all(suffix.as_bytes())?;
        }
        out.write_all(b"\n")?;
        out.write_all(&self.sequence)?;
        out.write_all(b"\n+\n")?;
        out.write_all(&self.quality)?;
        out.write_all(b"\n")
    }
}

impl From<fastq::Record> for FastqRecord {
    fn from(record: fastq::Record) -> Self {
        Self {
            name: record.id().to_string(),
            suffix: record.desc().map(ToString::to_string),
            sequence: record.seq().to_vec(),
            quality: record.qual().to_vec(),
        }
    }
}

type Records = Box<dyn Iterator<Item = fastq::Result<fastq::Record>> + Send>;

/// Sequential reader over a (possibly multi-member) gzip FASTQ file.
pub struct FastqStream {
    path: PathBuf,
    records: Records,
}

impl FastqStream {
    pub fn open(path: &Path) -> Result<Self, UmiError> {
        let file = File::open(path).map_err(|source| UmiError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = fastq::Reader::new(MultiGzDecoder::new(file));
        Ok(Self {
            path: path.to_path_buf(),
            records: Box::new(reader.records()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_record(&mut self) -> Result<Option<FastqRecord>, UmiError> {
        match self.records.next() {
            None => Ok(None),
            Some(Ok(record)) => Ok(Some(record.into())),
            Some(Err(e)) => Err(UmiError::Read {
                path: self.path.clone(),
                message: e.to_string(),
            }),
        }
    }
}
