//! Compressed output files for merged reads.
//!
//! A sink is either an external compressor process whose stdout is the
//! output file, or in-process gzip. `finish` shuts both down in a fixed
//! order: flush buffered bytes, close the compressor input, wait for the
//! process, then sync and close the file.

use flate2::write::GzEncoder;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// Argv of a compressor reading stdin and writing stdout (`gzip -c`).
    External(Vec<String>),
    Inline,
}

enum Backend {
    Process {
        child: Child,
        stdin: Option<BufWriter<ChildStdin>>,
        file: Option<File>,
    },
    Inline(Option<GzEncoder<BufWriter<File>>>),
}

pub struct CompressionSink {
    path: PathBuf,
    backend: Backend,
    finished: bool,
}

impl CompressionSink {
    pub fn create(path: &Path, compression: &Compression) -> io::Result<Self> {
        let file = File::create(path)?;
        let backend = match compression {
            Compression::Inline => Backend::Inline(Some(GzEncoder::new(
                BufWriter::new(file),
                flate2::Compression::default(),
            ))),
            Compression::External(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "empty compressor command",
                    ));
                };
                debug!("Spawning '{}' for '{}'", argv.join(" "), path.display());
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::from(file.try_clone()?))
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("compressor stdin was not captured"))?;
                Backend::Process {
                    child,
                    stdin: Some(BufWriter::new(stdin)),
                    file: Some(file),
                }
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            backend,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, close, wait and sync. Safe to call more than once.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match &mut self.backend {
            Backend::Process { child, stdin, file } => {
                let flushed = match stdin.take() {
                    Some(mut writer) => writer.flush(),
                    None => Ok(()),
                };
                // stdin is dropped here so the compressor sees EOF
                let status = child.wait()?;
                flushed?;
                if !status.success() {
                    return Err(io::Error::other(format!(
                        "compressor for '{}' exited with {status}",
                        self.path.display()
                    )));
                }
                if let Some(file) = file.take() {
                    file.sync_all()?;
                }
                Ok(())
            }
            Backend::Inline(encoder) => match encoder.take() {
                Some(encoder) => {
                    let writer = encoder.finish()?;
                    let file = writer.into_inner().map_err(|e| e.into_error())?;
                    file.sync_all()
                }
                None => Ok(()),
            },
        }
    }

    fn writer(&mut self) -> io::Result<&mut dyn Write> {
        match &mut self.backend {
            Backend::Process {
                stdin: Some(stdin), ..
            } => Ok(stdin),
            Backend::Inline(Some(encoder)) => Ok(encoder),
            _ => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink already finished",
            )),
        }
    }
}

impl Write for CompressionSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for CompressionSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Could not close '{}': {e}", self.path.display());
        }
    }
}
