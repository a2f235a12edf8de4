//! Configuration shared by both driver modes (§6 "External interfaces").
//!
//! CLI parsing and device-tree/bootrom glue belong to the functional model
//! and are out of scope here; this module only carries the plain
//! configuration structs the drivers are constructed from, in the teacher's
//! style of small `Debug + Clone` prop structs built up from [`crate::cli`].

use std::path::PathBuf;

/// Burst size for the checkpoint/rewind driver (C6): how many instructions
/// the functional model runs before the driver scans for a hook hit.
pub const INSN_PER_CKPT: u64 = 100_000;

/// Safety margin subtracted from the forward-step count before fast-forward,
/// to absorb nondeterminism between the bursted scan and re-execution.
pub const INTERLEAVE: u64 = 5_000;

/// How often (in retired instructions) the trace-driven driver polls the
/// guest's tohost MMIO word for syscall proxying.
pub const TOHOST_POLL_PERIOD: u64 = 100;

/// How often (in retired instructions) the trace-driven driver flushes its
/// captured sub-trace and accumulated events.
pub const SPIKE_LOG_FLUSH_PERIOD: u64 = 10_000;

/// A named objdump disassembly, e.g. `("k", "/path/to/vmlinux.dump")`.
#[derive(Debug, Clone)]
pub struct ObjdumpSpec {
    pub name: String,
    pub path: PathBuf,
}

/// A named DWARF binary, handed off whole to the (external) stack-unwinder.
#[derive(Debug, Clone)]
pub struct DwarfSpec {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub objdumps: Vec<ObjdumpSpec>,
    pub dwarf_paths: Vec<DwarfSpec>,
    pub output_dir: PathBuf,
    pub insn_per_ckpt: u64,
    pub interleave: u64,
}

impl ProfilerConfig {
    pub fn kernel_objdump_path(&self) -> Option<&PathBuf> {
        self.objdumps
            .iter()
            .find(|o| o.name == "k")
            .map(|o| &o.path)
    }
}

/// Additional configuration for replay mode: where the pre-recorded
/// cycle-accurate trace chunks live.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub trace_dir: PathBuf,
    pub hartid: u32,
    pub reader_buffers: usize,
    pub reader_threads: usize,
    pub tohost_poll_period: u64,
    pub spike_log_flush_period: u64,
}
