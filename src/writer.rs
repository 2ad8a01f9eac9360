//! Append-only JSONL sink for result envelopes.
//!
//! A single background thread owns the file so concurrent probes never
//! interleave partial lines. Without an initialized writer, each result is
//! appended synchronously instead.

use crate::config::DEFAULT_RESULTS_FILE;
use crate::model::ResultEnvelope;
use crossbeam_channel::Sender;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info};

const QUEUE_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("open results file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("encode result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write result: {0}")]
    Write(#[from] io::Error),
}

pub struct ResultWriter {
    path: PathBuf,
    sender: Option<Sender<ResultEnvelope>>,
    join: Option<JoinHandle<()>>,
}

impl ResultWriter {
    /// Opens `path` for append (creating it) and starts the writer thread.
    pub fn start(path: impl AsRef<Path>) -> Result<Self, WriterError> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        let (tx, rx) = crossbeam_channel::bounded::<ResultEnvelope>(QUEUE_DEPTH);
        let join = thread::spawn(move || {
            let mut out = BufWriter::new(file);
            for envelope in rx {
                if let Err(err) = encode_line(&mut out, &envelope) {
                    error!(error = %err, "encode result");
                }
            }
            if let Err(err) = out.flush() {
                error!(error = %err, "flush results file");
            }
        });
        Ok(Self {
            path,
            sender: Some(tx),
            join: Some(join),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues one envelope. Blocks while the queue is full.
    pub fn submit(&self, envelope: ResultEnvelope) {
        if let Some(sender) = &self.sender {
            if sender.send(envelope).is_err() {
                error!("result writer thread is gone, dropping result");
            }
        }
    }

    /// Drains every queued envelope and closes the file.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("result writer thread panicked");
            }
        }
    }
}

impl Drop for ResultWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_append(path: &Path) -> Result<File, WriterError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| WriterError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn encode_line(out: &mut impl Write, envelope: &ResultEnvelope) -> Result<(), WriterError> {
    serde_json::to_writer(&mut *out, envelope)?;
    out.write_all(b"\n")?;
    Ok(())
}

struct GlobalSink {
    path: Option<PathBuf>,
    writer: Option<ResultWriter>,
}

static SINK: Mutex<GlobalSink> = Mutex::new(GlobalSink {
    path: None,
    writer: None,
});
static FALLBACK_NOTICE: Once = Once::new();

/// Starts the process-wide writer. Later calls are no-ops while one is running.
pub fn init_result_writer(path: impl AsRef<Path>) {
    let path = path.as_ref().to_path_buf();
    let mut sink = SINK.lock().unwrap_or_else(PoisonError::into_inner);
    sink.path = Some(path.clone());
    if sink.writer.is_some() {
        return;
    }
    info!(path = %path.display(), "results file (append)");
    match ResultWriter::start(&path) {
        Ok(writer) => sink.writer = Some(writer),
        Err(err) => error!(error = %err, "result writer not started"),
    }
}

/// Flushes queued results and stops the process-wide writer.
pub fn close_result_writer() {
    let writer = SINK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .writer
        .take();
    if let Some(writer) = writer {
        writer.close();
    }
}

pub fn write_result(envelope: ResultEnvelope) {
    let mut sink = SINK.lock().unwrap_or_else(PoisonError::into_inner);
    let sender = sink.writer.as_ref().and_then(|w| w.sender.clone());
    if let Some(sender) = sender {
        drop(sink);
        if sender.send(envelope).is_err() {
            error!("result writer thread is gone, dropping result");
        }
        return;
    }

    let path = sink
        .path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_RESULTS_FILE))
        .clone();
    drop(sink);
    FALLBACK_NOTICE.call_once(|| info!(path = %path.display(), "writer fallback, results file (append)"));
    if let Err(err) = append_one(&path, &envelope) {
        error!(error = %err, "write result");
    }
}

fn append_one(path: &Path, envelope: &ResultEnvelope) -> Result<(), WriterError> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    let mut file = open_append(path)?;
    file.write_all(&line)?;
    Ok(())
}
