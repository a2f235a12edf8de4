//! Command-line configuration (§6 "Configuration (functional mode / replay mode)").
//!
//! Parsing device trees, bootroms, and functional-model flags is the
//! simulator's own concern; this only collects the paths and counters the
//! profiler itself consumes (symbol tables, output location, replay inputs).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{DwarfSpec, ObjdumpSpec, ProfilerConfig, ReplayConfig};

#[derive(Debug, Parser)]
#[command(
    name = "rvtrace",
    version,
    about = "Whole-system profiler for a simulated RISC-V target."
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the checkpoint/rewind driver against a live functional model.
    Profile(ProfileArgs),

    /// Replay a pre-recorded cycle-accurate trace against the functional model.
    Replay(ReplayArgs),

    /// Post-run: feed a completed profiler run's PC-trace files through the
    /// stack-unwinder adapter.
    Unwind(UnwindArgs),
}

#[derive(Debug, Args)]
pub struct SymbolArgs {
    /// Objdump disassembly, `name=path` (e.g. `k=vmlinux.objdump`). Repeatable.
    #[arg(long = "objdump", value_parser = parse_name_path)]
    pub objdumps: Vec<(String, PathBuf)>,

    /// DWARF binary for the stack-unwinder, `name=path`. Repeatable.
    #[arg(long = "dwarf", value_parser = parse_name_path)]
    pub dwarfs: Vec<(String, PathBuf)>,

    /// Directory PC-trace files, the event trace, and the ASID dump are written to.
    #[arg(long, default_value = "rvtrace-out")]
    pub output_dir: PathBuf,
}

impl SymbolArgs {
    pub fn objdump_specs(&self) -> Vec<ObjdumpSpec> {
        self.objdumps
            .iter()
            .map(|(name, path)| ObjdumpSpec {
                name: name.clone(),
                path: path.clone(),
            })
            .collect()
    }

    pub fn dwarf_specs(&self) -> Vec<DwarfSpec> {
        self.dwarfs
            .iter()
            .map(|(name, path)| DwarfSpec {
                name: name.clone(),
                path: path.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[command(flatten)]
    pub symbols: SymbolArgs,

    /// Instructions to run per checkpoint burst before scanning for a hook crossing.
    #[arg(long, default_value_t = crate::config::INSN_PER_CKPT)]
    pub insn_per_ckpt: u64,

    /// How far before a detected hook crossing the rewind replay fast-forwards.
    #[arg(long, default_value_t = crate::config::INTERLEAVE)]
    pub interleave: u64,
}

impl ProfileArgs {
    pub fn profiler_config(&self) -> ProfilerConfig {
        ProfilerConfig {
            objdumps: self.symbols.objdump_specs(),
            dwarf_paths: self.symbols.dwarf_specs(),
            output_dir: self.symbols.output_dir.clone(),
            insn_per_ckpt: self.insn_per_ckpt,
            interleave: self.interleave,
        }
    }
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub symbols: SymbolArgs,

    /// Directory of `COSPIKE-TRACE-<hartid>-<index>.gz` chunks.
    #[arg(long)]
    pub trace_dir: PathBuf,

    /// Hart whose trace chunks are being replayed.
    #[arg(long, default_value_t = 0)]
    pub hartid: u32,

    /// How many parsed trace chunks may be in flight at once.
    #[arg(long, default_value_t = 4)]
    pub reader_buffers: usize,

    /// Worker threads prefetching and parsing trace chunks.
    #[arg(long, default_value_t = 2)]
    pub reader_threads: usize,
}

impl ReplayArgs {
    pub fn profiler_config(&self) -> ProfilerConfig {
        ProfilerConfig {
            objdumps: self.symbols.objdump_specs(),
            dwarf_paths: self.symbols.dwarf_specs(),
            output_dir: self.symbols.output_dir.clone(),
            insn_per_ckpt: crate::config::INSN_PER_CKPT,
            interleave: crate::config::INTERLEAVE,
        }
    }

    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            trace_dir: self.trace_dir.clone(),
            hartid: self.hartid,
            reader_buffers: self.reader_buffers,
            reader_threads: self.reader_threads,
            tohost_poll_period: crate::config::TOHOST_POLL_PERIOD,
            spike_log_flush_period: crate::config::SPIKE_LOG_FLUSH_PERIOD,
        }
    }
}

#[derive(Debug, Args)]
pub struct UnwindArgs {
    /// Directory containing `SPIKETRACE-*` files and the `asid2bin.txt` dump
    /// from a completed profiler run.
    #[arg(long)]
    pub run_dir: PathBuf,

    #[command(flatten)]
    pub symbols: SymbolArgs,
}

fn parse_name_path(s: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected `name=path`, got {s:?}"))?;
    if name.is_empty() {
        return Err(format!("empty name in {s:?}"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_path_pair() {
        assert_eq!(
            parse_name_path("k=vmlinux.objdump").unwrap(),
            ("k".to_string(), PathBuf::from("vmlinux.objdump"))
        );
        assert!(parse_name_path("novalue").is_err());
        assert!(parse_name_path("=novalue").is_err());
    }

    #[test]
    fn profile_subcommand_parses_repeated_objdumps() {
        let opt = Opt::parse_from([
            "rvtrace",
            "profile",
            "--objdump",
            "k=vmlinux.objdump",
            "--objdump",
            "init=init.objdump",
            "--output-dir",
            "/tmp/out",
        ]);
        let Action::Profile(args) = opt.action else {
            panic!("expected Profile action");
        };
        assert_eq!(args.symbols.objdumps.len(), 2);
        assert_eq!(args.symbols.output_dir, PathBuf::from("/tmp/out"));
    }
}
