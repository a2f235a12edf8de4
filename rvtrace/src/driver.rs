//! The concrete driver (C4's owner): ties the functional model, the kernel
//! symbol index, profiler state, and the event logger together so that hooks
//! (C5) and the two run loops (C6, C7) all operate on one `&mut Driver`.

use std::path::PathBuf;

use rustc_hash::FxHashMap;

use rvtrace_events::{EventLogger, Packet};
use rvtrace_guest::GuestModel;
use rvtrace_state::ProfilerState;
use rvtrace_symbols::SymbolIndex;

use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, ProfilerResult};
use crate::hooks::{self, AsidHook, CfsPickHook, ExecHook, FinishSwitchHook, ForkHook};
use crate::pc_trace::PcTraceWriter;

/// All events share this Perfetto track; the reference implementation never
/// distinguishes tracks within a single hart's trace.
pub const PERFETTO_TRACKID_BASE: i32 = 1;

pub struct Driver {
    pub guest: Box<dyn GuestModel>,
    pub state: ProfilerState<Driver>,
    symbols: FxHashMap<String, SymbolIndex>,
    logger: EventLogger,
    pc_trace: PcTraceWriter,
    kernel_binary_name: String,
}

impl Driver {
    pub fn new(
        guest: Box<dyn GuestModel>,
        symbols: FxHashMap<String, SymbolIndex>,
        config: &ProfilerConfig,
    ) -> ProfilerResult<Self> {
        if !symbols.contains_key("k") {
            return Err(ProfilerError::Setup(
                "no kernel objdump (name \"k\") was loaded".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.output_dir)?;
        let event_sink = config.output_dir.join("trace.pftrace.txt");
        let logger = EventLogger::new(event_sink)?;
        let pc_trace = PcTraceWriter::new(config.output_dir.clone());

        let mut driver = Driver {
            guest,
            state: ProfilerState::new(),
            symbols,
            logger,
            pc_trace,
            kernel_binary_name: "k".to_string(),
        };
        driver.register_hooks()?;
        Ok(driver)
    }

    pub fn kernel_symbols(&self) -> &SymbolIndex {
        &self.symbols[&self.kernel_binary_name]
    }

    pub fn symbols_for(&self, binary: &str) -> Option<&SymbolIndex> {
        self.symbols.get(binary)
    }

    fn register_hooks(&mut self) -> ProfilerResult<()> {
        let kernel = self.kernel_symbols();
        let exec_entry = kernel.entry_pc(hooks::FN_DO_EXECVEAT_COMMON)?;
        let exec_exits = kernel.exit_pcs(hooks::FN_DO_EXECVEAT_COMMON)?;
        let asid_pc = kernel.csr_write_pc(hooks::FN_SET_MM_ASID, "satp")?;
        let asid_exits = kernel.exit_pcs(hooks::FN_SET_MM_ASID)?;
        let clone_exits = kernel.exit_pcs(hooks::FN_KERNEL_CLONE)?;
        let pick_exits = kernel.exit_pcs(hooks::FN_PICK_NEXT_TASK_FAIR)?;
        let switch_entry = kernel.entry_pc(hooks::FN_FINISH_TASK_SWITCH)?;
        let switch_exits = kernel.exit_pcs(hooks::FN_FINISH_TASK_SWITCH)?;

        let table = self.state.hooks_mut();
        table.register_hook_at_start(exec_entry, Box::new(ExecHook), exec_exits);
        table.register_hook_at_start(asid_pc, Box::new(AsidHook), asid_exits);
        // kernel_clone/pick_next_task_fair are intercepted at their exit, but
        // they must still dispatch through the start path: they only ever
        // fire (no push) and must not be counted as pop points, since no
        // matching push for them was ever made.
        for exit in clone_exits {
            table.register_hook_at_start(exit, Box::new(ForkHook), []);
        }
        for exit in pick_exits {
            table.register_hook_at_start(exit, Box::new(CfsPickHook), []);
        }
        table.register_hook_at_start(switch_entry, Box::new(FinishSwitchHook), switch_exits);
        Ok(())
    }

    pub fn emit_instant(&mut self, name: &str) {
        let ts = self.state.timestamp();
        self.logger
            .submit_packet(Packet::instant(name, PERFETTO_TRACKID_BASE, ts));
    }

    pub fn emit_slice_begin(&mut self, name: &str) {
        let ts = self.state.timestamp();
        self.logger
            .submit_packet(Packet::slice_begin(name, PERFETTO_TRACKID_BASE, ts));
    }

    pub fn emit_slice_end(&mut self, name: &str) {
        let ts = self.state.timestamp();
        self.logger
            .submit_packet(Packet::slice_end(name, PERFETTO_TRACKID_BASE, ts));
    }

    /// Record one retired instruction's PC-trace line and advance the
    /// profiler timestamp, without touching the hook table. Used by the
    /// checkpoint driver (C6) for a whole burst at once (the burst already
    /// carries every instruction's PC; hooks only fire once the model has
    /// been rewound back to the exact landing point) and by the replay
    /// driver (C7), which steps one instruction at a time.
    pub fn record_step(&mut self, pc: u64, asid: u16, prv: u8, prev_prv: u8) {
        self.pc_trace.record(pc, asid, prv, prev_prv);
        self.state.advance_timestamp(1);
    }

    /// If a hook starts at `pc`, fire it and push its returned entry onto
    /// the current PID's call stack.
    ///
    /// The hook is taken out of the table before `update` runs and put back
    /// afterwards, since `update` needs `&mut Driver` and the table lives
    /// inside `self.state` — holding a borrow of the table across the call
    /// would alias `self`.
    pub fn fire_start_hook(&mut self, pc: u64) -> bool {
        let Some(hook) = self.state.hooks_mut().take_start_hook(pc) else {
            return false;
        };
        let entry = hook.update(self);
        self.state.hooks_mut().put_start_hook(pc, hook);
        if let Some(entry) = entry {
            let pid = self.state.get_current_pid();
            self.state.push(pid, entry);
        }
        true
    }

    /// If `pc` is a registered exit point, fire its optional hook and pop
    /// one entry off the current PID's call stack.
    pub fn fire_exit_hook(&mut self, pc: u64) -> bool {
        if !self.state.hooks().exits_at(pc) {
            return false;
        }
        if let Some(hook) = self.state.hooks_mut().take_exit_hook(pc) {
            hook.update(self);
            self.state.hooks_mut().put_exit_hook(pc, hook);
        }
        let pid = self.state.get_current_pid();
        self.state.pop(pid);
        true
    }

    /// Convenience used by the replay driver: record the step and dispatch
    /// whichever hook (if any) matches its PC.
    pub fn on_retired_pc(&mut self, pc: u64, asid: u16, prv: u8, prev_prv: u8) {
        self.record_step(pc, asid, prv, prev_prv);
        if !self.fire_start_hook(pc) {
            self.fire_exit_hook(pc);
        }
    }

    pub fn is_registered_start(&self, pc: u64) -> bool {
        self.state.hooks().started_at(pc).is_some()
    }

    pub fn is_registered_exit(&self, pc: u64) -> bool {
        self.state.hooks().exits_at(pc)
    }

    /// Drain any buffered event packets to the sink now, rather than
    /// waiting for the batch threshold. Called once per burst/flush-period
    /// by the run loops so the on-disk trace stays close to real time.
    pub fn flush_events(&mut self) {
        self.logger.flush();
    }

    pub fn asid_dump_path(&self) -> PathBuf {
        self.pc_trace.output_dir().join("asid2bin.txt")
    }

    pub fn finish(mut self) -> ProfilerResult<()> {
        self.pc_trace.flush();
        self.state.dump_asid2bin_mapping(self.asid_dump_path())?;
        self.logger.stop();
        Ok(())
    }
}
