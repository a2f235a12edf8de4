//! Stack-unwinder adapter (C8): post-run pass that re-reads the PC-trace
//! files, classifies each retired PC as kernel or a userspace binary via the
//! ASID map, and feeds `(pc, cycle, binary)` through a C2 queue to the
//! DWARF-based unwinder. The unwinder itself is an external collaborator,
//! not reimplemented here.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use rvtrace_queue::WorkQueue;

use crate::pc_trace::spiketrace_filename;

/// How many `(pc, cycle, binary)` triples accumulate before the batch is
/// pushed to the unwinder's worker, mirroring the reference's flush threshold.
const INSN_TRACE_FLUSH_THRESHOLD: usize = 1_000_000;

/// `(pc >> 32) == 0` is the kernel/user split: userspace binaries are
/// mapped below 4GiB, the kernel lives in the high half of the address space.
pub fn user_space_addr(va: u64) -> bool {
    (va >> 32) == 0
}

/// The external DWARF-based unwinder's interface: given a stream of
/// `(pc, cycle, binary)` triples it produces a nested call-stack report.
pub trait StackUnwinder: Send {
    fn submit_insn(&mut self, pc: u64, cycle: u64, binary: &str);
    fn stop(&mut self);
}

struct NamedInsn {
    pc: u64,
    cycle: u64,
    binary: String,
}

/// Batches retired instructions and hands them to a single-worker queue so
/// the unwinder's DWARF work overlaps the next chunk's file I/O.
pub struct UnwindAdapter {
    queue: WorkQueue<Vec<NamedInsn>>,
    buffer: Vec<NamedInsn>,
}

impl UnwindAdapter {
    pub fn new(unwinder: Box<dyn StackUnwinder>) -> Self {
        let unwinder = Arc::new(Mutex::new(unwinder));
        let queue = WorkQueue::new(1, move |batch: Vec<NamedInsn>| {
            let mut unwinder = unwinder.lock();
            for insn in batch {
                unwinder.submit_insn(insn.pc, insn.cycle, &insn.binary);
            }
        });
        UnwindAdapter {
            queue,
            buffer: Vec::new(),
        }
    }

    pub fn add_instruction(&mut self, pc: u64, cycle: u64, binary: impl Into<String>) {
        self.buffer.push(NamedInsn {
            pc,
            cycle,
            binary: binary.into(),
        });
        if self.buffer.len() >= INSN_TRACE_FLUSH_THRESHOLD {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.queue.queue_job(batch);
    }

    pub fn stop(mut self) {
        self.flush();
        self.queue.stop();
    }
}

/// Read back the `<asid_dec> <binary_path>` dump written by the profiler run.
pub fn load_asid_map(path: impl AsRef<Path>) -> io::Result<FxHashMap<u16, String>> {
    let file = File::open(path)?;
    let mut map = FxHashMap::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(asid), Some(binary)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(asid) = asid.parse::<u16>() {
            map.insert(asid, binary.to_string());
        }
    }
    Ok(map)
}

/// Count the contiguous `SPIKETRACE-{0..}` files present in `dir`.
pub fn spiketrace_count(dir: &Path) -> u64 {
    let mut count = 0u64;
    while dir.join(spiketrace_filename(count)).is_file() {
        count += 1;
    }
    count
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Drive the whole post-run pass: for every `SPIKETRACE-*` file in order,
/// classify each record and feed it to `adapter`.
pub fn run_unwind_pass(
    output_dir: &Path,
    asid_to_bin: &FxHashMap<u16, String>,
    adapter: &mut UnwindAdapter,
) -> io::Result<()> {
    let file_count = spiketrace_count(output_dir);
    let mut cycle = 0u64;
    for idx in 0..file_count {
        let path = output_dir.join(spiketrace_filename(idx));
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (Some(pc_hex), Some(asid_dec)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(pc) = u64::from_str_radix(pc_hex, 16) else {
                continue;
            };
            let Ok(asid) = asid_dec.parse::<u16>() else {
                continue;
            };

            if user_space_addr(pc) {
                if let Some(binary) = asid_to_bin.get(&asid) {
                    adapter.add_instruction(pc, cycle, basename(binary));
                } else {
                    adapter.add_instruction(pc, cycle, "kernel");
                }
            } else {
                adapter.add_instruction(pc, cycle, "kernel");
            }
            cycle += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn classifies_kernel_vs_user_addresses() {
        assert!(user_space_addr(0x0000_0000_1000));
        assert!(!user_space_addr(0xffff_ffff_8000_0000));
    }

    #[test]
    fn basename_strips_directory_components() {
        assert_eq!(basename("/root/bin/hello.linux.riscv"), "hello.linux.riscv");
        assert_eq!(basename("hello"), "hello");
    }

    #[test]
    fn loads_asid_dump_back_into_a_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asid2bin.txt");
        std::fs::write(&path, "3 /root/bin/a.out\n7 /root/bin/b.out\n").unwrap();
        let map = load_asid_map(&path).unwrap();
        assert_eq!(map.get(&3).unwrap(), "/root/bin/a.out");
        assert_eq!(map.get(&7).unwrap(), "/root/bin/b.out");
    }

    struct CountingUnwinder {
        count: Arc<AtomicUsize>,
    }

    impl StackUnwinder for CountingUnwinder {
        fn submit_insn(&mut self, _pc: u64, _cycle: u64, _binary: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn run_unwind_pass_feeds_every_record_to_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let mut f0 = File::create(dir.path().join(spiketrace_filename(0))).unwrap();
        writeln!(f0, "1000 0 1 0").unwrap();
        writeln!(f0, "ffffffff80000000 0 3 1").unwrap();
        drop(f0);

        let mut asid_to_bin = FxHashMap::default();
        asid_to_bin.insert(0u16, "/root/bin/hello".to_string());

        let count = Arc::new(AtomicUsize::new(0));
        let adapter_count = Arc::clone(&count);
        let mut adapter = UnwindAdapter::new(Box::new(CountingUnwinder {
            count: adapter_count,
        }));
        run_unwind_pass(dir.path(), &asid_to_bin, &mut adapter).unwrap();
        adapter.stop();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
