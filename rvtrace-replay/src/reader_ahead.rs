//! Reader-ahead for trace replay (C9): a pool of worker threads decompresses
//! and parses `COSPIKE-TRACE-<hartid>-<index>.gz` chunks ahead of the
//! consumer, so the trace-driven driver (C7) is never I/O-bound.
//!
//! Chunk claiming is a single small mutex around "next index to fetch";
//! once claimed, a chunk's records flow to the consumer over a bounded
//! channel (capacity `n_buffers`), which is the SPSC ring per buffer the
//! design calls for, minus the hand-rolled index bookkeeping. Because
//! several workers can finish out of claim order, the consumer reorders
//! completed chunks by index before draining them.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use rvtrace_guest::ValidationStep;

use crate::record::parse_trace_line;

pub fn chunk_path(dir: &Path, hartid: u32, index: u64) -> PathBuf {
    dir.join(format!("COSPIKE-TRACE-{hartid}-{index}.gz"))
}

/// Count the contiguous `COSPIKE-TRACE-<hartid>-{0..}.gz` chunks present in
/// `dir`, per the "contiguous indices starting at 0" naming contract.
pub fn chunk_count(dir: &Path, hartid: u32) -> u64 {
    let mut count = 0u64;
    while chunk_path(dir, hartid, count).is_file() {
        count += 1;
    }
    count
}

struct FilledChunk {
    index: u64,
    records: Vec<ValidationStep>,
}

/// Multi-threaded prefetch of trace chunks into parsed buffers.
pub struct TraceReaderAhead {
    filled_rx: Receiver<FilledChunk>,
    workers: Vec<JoinHandle<()>>,
    reorder: BTreeMap<u64, Vec<ValidationStep>>,
    next_wanted: u64,
    total_chunks: u64,
}

impl TraceReaderAhead {
    /// `n_buffers` bounds how many parsed chunks may be in flight at once
    /// (the "N buffers" of the design); `n_readers` is the worker-thread count.
    pub fn new(dir: impl Into<PathBuf>, hartid: u32, n_buffers: usize, n_readers: usize) -> Self {
        let dir: PathBuf = dir.into();
        let total_chunks = chunk_count(&dir, hartid);
        let (filled_tx, filled_rx): (Sender<FilledChunk>, Receiver<FilledChunk>) =
            bounded(n_buffers.max(1));
        let next_claim = Arc::new(Mutex::new(0u64));

        let workers = (0..n_readers.max(1))
            .map(|_| {
                let dir = dir.clone();
                let filled_tx = filled_tx.clone();
                let next_claim = Arc::clone(&next_claim);
                std::thread::spawn(move || {
                    reader_worker_loop(dir, hartid, total_chunks, next_claim, filled_tx);
                })
            })
            .collect();
        drop(filled_tx);

        TraceReaderAhead {
            filled_rx,
            workers,
            reorder: BTreeMap::new(),
            next_wanted: 0,
            total_chunks,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Drain the next chunk's records, in index order, blocking until it is
    /// available. Returns `None` once every chunk has been delivered.
    pub fn next_chunk(&mut self) -> Option<Vec<ValidationStep>> {
        if self.next_wanted >= self.total_chunks {
            return None;
        }
        loop {
            if let Some(records) = self.reorder.remove(&self.next_wanted) {
                self.next_wanted += 1;
                return Some(records);
            }
            match self.filled_rx.recv() {
                Ok(chunk) => {
                    self.reorder.insert(chunk.index, chunk.records);
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for TraceReaderAhead {
    fn drop(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn reader_worker_loop(
    dir: PathBuf,
    hartid: u32,
    total_chunks: u64,
    next_claim: Arc<Mutex<u64>>,
    filled_tx: Sender<FilledChunk>,
) {
    loop {
        let index = {
            let mut guard = next_claim.lock();
            if *guard >= total_chunks {
                return;
            }
            let claimed = *guard;
            *guard += 1;
            claimed
        };

        let path = chunk_path(&dir, hartid, index);
        let records = match read_and_parse_chunk(&path) {
            Ok(records) => records,
            Err(err) => {
                log::error!("failed to read trace chunk {}: {err}", path.display());
                Vec::new()
            }
        };

        if filled_tx.send(FilledChunk { index, records }).is_err() {
            return;
        }
    }
}

fn read_and_parse_chunk(path: &Path) -> std::io::Result<Vec<ValidationStep>> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let reader = BufReader::new(decoder);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match parse_trace_line(&line) {
            Ok(rec) => records.push(rec),
            Err(err) => log::warn!("skipping malformed trace line in {}: {err}", path.display()),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_chunk(dir: &Path, hartid: u32, index: u64, times: &[u64]) {
        let path = chunk_path(dir, hartid, index);
        let file = File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        for t in times {
            writeln!(
                enc,
                "{t} 1 0xffffffff80000000 0x0 0 0 0 0 0x0 0"
            )
            .unwrap();
        }
        enc.finish().unwrap();
    }

    #[test]
    fn drains_chunks_in_order_despite_concurrent_readers() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6u64 {
            write_chunk(dir.path(), 0, i, &[i * 10, i * 10 + 1]);
        }
        let mut reader = TraceReaderAhead::new(dir.path(), 0, 3, 4);
        assert_eq!(reader.total_chunks(), 6);

        let mut times = Vec::new();
        while let Some(chunk) = reader.next_chunk() {
            for rec in chunk {
                times.push(rec.time);
            }
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted, "records must drain in non-decreasing time order");
        assert_eq!(times.len(), 12);
    }

    #[test]
    fn empty_directory_yields_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = TraceReaderAhead::new(dir.path(), 0, 2, 2);
        assert_eq!(reader.total_chunks(), 0);
        assert!(reader.next_chunk().is_none());
    }
}
