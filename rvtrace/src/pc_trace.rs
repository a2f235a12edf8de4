//! PC-trace output (§6 "PC-trace output file"): one line per retired
//! instruction, rotated into `SPIKETRACE-<10-digit-zero-padded-index>` files
//! so the post-run unwinder (C8) can reassemble them in order.
//!
//! Writing goes through a single-worker [`WorkQueue`] for the same reason
//! the event logger uses one: file writes must land in the order the driver
//! produced them.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rvtrace_queue::WorkQueue;

/// How many records accumulate in one `SPIKETRACE-*` file before the writer
/// rotates to the next index. Chosen to match the checkpoint burst size
/// (§4.6's `INSN_PER_CKPT`), so functional mode produces roughly one file per
/// checkpoint; replay mode uses the same constant for file-size uniformity.
pub const RECORDS_PER_FILE: usize = 100_000;

pub fn spiketrace_filename(idx: u64) -> String {
    format!("SPIKETRACE-{idx:010}")
}

struct RecordBatch {
    index: u64,
    lines: Vec<String>,
}

pub struct PcTraceWriter {
    output_dir: PathBuf,
    buffer: Vec<String>,
    next_index: u64,
    queue: WorkQueue<RecordBatch>,
}

impl PcTraceWriter {
    pub fn new(output_dir: PathBuf) -> Self {
        let dir = output_dir.clone();
        let queue = WorkQueue::new(1, move |batch: RecordBatch| {
            let path = dir.join(spiketrace_filename(batch.index));
            match File::create(&path) {
                Ok(file) => {
                    let mut w = BufWriter::new(file);
                    for line in &batch.lines {
                        if let Err(err) = writeln!(w, "{line}") {
                            log::error!("failed to write {}: {err}", path.display());
                        }
                    }
                    if let Err(err) = w.flush() {
                        log::error!("failed to flush {}: {err}", path.display());
                    }
                }
                Err(err) => log::error!("failed to create {}: {err}", path.display()),
            }
        });
        PcTraceWriter {
            output_dir,
            buffer: Vec::with_capacity(RECORDS_PER_FILE),
            next_index: 0,
            queue,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn record(&mut self, pc: u64, asid: u16, prv: u8, prev_prv: u8) {
        self.buffer.push(format!("{pc:x} {asid} {prv} {prev_prv}"));
        if self.buffer.len() >= RECORDS_PER_FILE {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let lines = std::mem::replace(&mut self.buffer, Vec::with_capacity(RECORDS_PER_FILE));
        let index = self.next_index;
        self.next_index += 1;
        self.queue.queue_job(RecordBatch { index, lines });
    }

    /// Flush any partial trailing file and join the writer.
    pub fn flush(&mut self) {
        self.rotate();
        self.queue.stop();
    }

    pub fn file_count(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_ten_digit_zero_padded() {
        assert_eq!(spiketrace_filename(0), "SPIKETRACE-0000000000");
        assert_eq!(spiketrace_filename(42), "SPIKETRACE-0000000042");
    }

    #[test]
    fn rotates_and_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PcTraceWriter::new(dir.path().to_path_buf());
        for i in 0..(RECORDS_PER_FILE + 5) {
            writer.record(i as u64, 3, 1, 0);
        }
        writer.flush();
        assert_eq!(writer.file_count(), 2);
        let first = std::fs::read_to_string(dir.path().join(spiketrace_filename(0))).unwrap();
        assert_eq!(first.lines().count(), RECORDS_PER_FILE);
        let second = std::fs::read_to_string(dir.path().join(spiketrace_filename(1))).unwrap();
        assert_eq!(second.lines().count(), 5);
    }
}
