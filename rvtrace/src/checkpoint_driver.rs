//! Checkpoint/rewind driver (C6): runs the functional model in large bursts,
//! then rewinds and single-steps only when a burst crossed a registered hook
//! PC, so the expensive per-instruction hook dispatch only ever runs at the
//! exact instant it is needed.

use rvtrace_guest::GuestStep;

use crate::config::{INSN_PER_CKPT, INTERLEAVE};
use crate::driver::Driver;
use crate::error::ProfilerResult;
use crate::stop_flag::StopFlag;

/// How many extra instructions beyond `fwd_steps` the single-step rewind
/// phase is allowed before giving up and logging a rewind miss (§7).
const REWIND_SLACK: u64 = 4 * INTERLEAVE;

pub struct CheckpointDriver {
    driver: Driver,
    hart: usize,
}

impl CheckpointDriver {
    pub fn new(driver: Driver) -> Self {
        CheckpointDriver { driver, hart: 0 }
    }

    pub fn run(mut self, stop: &StopFlag) -> ProfilerResult<Driver> {
        while self.driver.guest.target_running() && !stop.is_set() {
            self.run_burst();
        }
        self.driver.finish()?;
        Ok(self.driver)
    }

    /// Runs one checkpoint/burst/scan cycle. The original burst is only
    /// ever *scanned*, never committed, when it turns out to cross a hook
    /// PC: once that happens the burst is discarded and replaced by the
    /// rewound-and-replayed trace, so no instruction is ever logged twice.
    fn run_burst(&mut self) {
        let checkpoint = self.driver.guest.checkpoint();
        let burst = self.driver.guest.run_for(self.hart, INSN_PER_CKPT);

        let mut rewind_at = None;
        let mut popcnt = 0u64;
        for (i, step) in burst.iter().enumerate() {
            if self.driver.is_registered_start(step.pc) {
                rewind_at = Some(i as u64);
                break;
            } else if self.driver.is_registered_exit(step.pc) {
                popcnt += 1;
            }
        }

        let pid = self.driver.state.get_current_pid();
        for _ in 0..popcnt {
            self.driver.state.pop(pid);
        }

        match rewind_at {
            None => {
                for step in &burst {
                    record(&mut self.driver, step);
                }
            }
            Some(fwd_steps) => self.rewind_and_fire(checkpoint, fwd_steps),
        }

        self.driver.flush_events();
    }

    /// Deserialize the pre-burst checkpoint, fast-forward to just shy of the
    /// crossing, then single-step (recording every instruction as we go)
    /// until the hook PC is seen, fire it, and take one more step past it so
    /// the model lands exactly where the next burst should resume from.
    fn rewind_and_fire(&mut self, checkpoint: rvtrace_guest::Checkpoint, fwd_steps: u64) {
        self.driver.guest.restore(&checkpoint);
        let fast_forward = fwd_steps.saturating_sub(INTERLEAVE);
        for step in self.driver.guest.run_for(self.hart, fast_forward) {
            record(&mut self.driver, &step);
        }

        let mut stepped = 0u64;
        loop {
            let pc = self.driver.guest.pc(self.hart);
            let found = self.driver.is_registered_start(pc);
            if found {
                self.driver.fire_start_hook(pc);
            }

            for step in self.driver.guest.run_for(self.hart, 1) {
                record(&mut self.driver, &step);
            }

            if found {
                return;
            }
            stepped += 1;
            if stepped >= INTERLEAVE + REWIND_SLACK {
                log::warn!(
                    "rewind miss: no hook PC reached after {stepped} single steps from checkpoint"
                );
                return;
            }
        }
    }
}

fn record(driver: &mut Driver, step: &GuestStep) {
    driver.record_step(
        step.pc,
        step.asid,
        step.privilege.encoded(),
        step.previous_privilege.encoded(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use rvtrace_guest::{
        Checkpoint, GuestError, GuestModel, InterruptCause, Privilege, StepEffects, StepOutcome,
    };
    use rvtrace_symbols::SymbolIndex;

    use crate::config::ProfilerConfig;

    const TEST_OBJDUMP: &str = "\
0000000000001000 <do_execveat_common.isra.0>:\n\
1000: 1141       addi sp,sp,-16\n\
1008: 8082       ret\n\
\n\
0000000000002000 <set_mm_asid>:\n\
2000: 1141       addi sp,sp,-16\n\
2004: 10579073   csrw satp,a5\n\
2008: 8082       ret\n\
\n\
0000000000003000 <kernel_clone>:\n\
3000: 1141       addi sp,sp,-16\n\
3008: 8082       ret\n\
\n\
0000000000004000 <pick_next_task_fair>:\n\
4000: 1141       addi sp,sp,-16\n\
4008: 8082       ret\n\
\n\
0000000000005000 <finish_task_switch.isra.0>:\n\
5000: 1141       addi sp,sp,-16\n\
5008: 8082       ret\n";

    /// A guest model whose whole architectural state is one cursor into a
    /// fixed PC stream, so checkpoint/restore is trivial and deterministic.
    struct LinearGuest {
        pcs: Vec<u64>,
        index: u64,
    }

    impl GuestModel for LinearGuest {
        fn hart_count(&self) -> usize {
            1
        }

        fn pc(&self, _hart: usize) -> u64 {
            self.pcs[self.index as usize]
        }

        fn asid(&self, _hart: usize) -> u16 {
            0
        }

        fn privilege(&self, _hart: usize) -> Privilege {
            Privilege::Supervisor
        }

        fn gpr(&self, _hart: usize, _reg_index: usize) -> u64 {
            0
        }

        fn set_gpr(&mut self, _hart: usize, _reg_index: usize, _value: u64) {}

        fn load_u8(&self, _hart: usize, _va: u64) -> Result<u8, GuestError> {
            Ok(0)
        }

        fn load_u64(&self, _hart: usize, _va: u64) -> Result<u64, GuestError> {
            Ok(0)
        }

        fn step(&mut self, hart: usize) -> StepOutcome {
            let step = self.next_step(hart);
            StepOutcome::Advanced(step)
        }

        fn step_with_effects(&mut self, hart: usize) -> (StepOutcome, StepEffects) {
            (self.step(hart), StepEffects::default())
        }

        fn run_for(&mut self, hart: usize, count: u64) -> Vec<GuestStep> {
            let mut steps = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if (self.index as usize) >= self.pcs.len() {
                    break;
                }
                steps.push(self.next_step(hart));
            }
            steps
        }

        fn target_running(&self) -> bool {
            (self.index as usize) < self.pcs.len()
        }

        fn checkpoint(&self) -> Checkpoint {
            Checkpoint(self.index.to_le_bytes().to_vec())
        }

        fn restore(&mut self, checkpoint: &Checkpoint) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&checkpoint.0);
            self.index = u64::from_le_bytes(bytes);
        }

        fn assert_interrupt(&mut self, _hart: usize, _cause: InterruptCause) -> Result<(), GuestError> {
            Ok(())
        }

        fn clear_wfi(&mut self, _hart: usize) {}

        fn lower_interrupt(&mut self, _hart: usize, _cause: InterruptCause) {}

        fn poll_tohost(&mut self) -> bool {
            false
        }
    }

    impl LinearGuest {
        fn next_step(&mut self, _hart: usize) -> GuestStep {
            let pc = self.pcs[self.index as usize];
            let step = GuestStep {
                pc,
                asid: 0,
                privilege: Privilege::Supervisor,
                previous_privilege: Privilege::Supervisor,
                raw_instruction_bits: 0,
                cycle: self.index,
            };
            self.index += 1;
            step
        }
    }

    fn test_driver(pcs: Vec<u64>, output_dir: &std::path::Path) -> Driver {
        let mut symbols = rustc_hash::FxHashMap::default();
        symbols.insert("k".to_string(), SymbolIndex::parse(TEST_OBJDUMP).unwrap());

        let config = ProfilerConfig {
            objdumps: vec![],
            dwarf_paths: vec![],
            output_dir: output_dir.to_path_buf(),
            insn_per_ckpt: INSN_PER_CKPT,
            interleave: INTERLEAVE,
        };
        let guest: Box<dyn GuestModel> = Box::new(LinearGuest { pcs, index: 0 });
        Driver::new(guest, symbols, &config).unwrap()
    }

    #[test]
    fn burst_rewind_replays_only_up_to_and_past_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        // a burst of INSN_PER_CKPT instructions, with the asid hook's csrw
        // appearing at index 50, well short of needing two bursts.
        let mut pcs = vec![0x100u64; INSN_PER_CKPT as usize];
        pcs[50] = 0x2004;

        let driver = test_driver(pcs, dir.path());
        let mut cd = CheckpointDriver::new(driver);
        cd.run_burst();

        // the rewound replay commits only indices 0..=50 (51 instructions),
        // discarding the rest of the original 100_000-instruction burst.
        assert_eq!(cd.driver.state.timestamp(), 51);
        assert_eq!(
            cd.driver.guest.pc(0),
            0x100,
            "model must land one past the hook pc, matching the reference's trailing single step"
        );
        assert_eq!(cd.driver.state.stack(0).len(), 1);
        assert_eq!(cd.driver.state.stack(0)[0].function_name, "set_mm_asid");
    }

    #[test]
    fn fork_and_cfs_pick_hooks_fire_without_pushing_or_popping() {
        let dir = tempfile::tempdir().unwrap();
        // kernel_clone's and pick_next_task_fair's exit pcs, both well
        // within the first burst. Neither hook ever pushes a callstack
        // entry, and crossing them must not register as a pop either.
        let mut pcs = vec![0x100u64; INSN_PER_CKPT as usize];
        pcs[50] = 0x3008;
        pcs[80] = 0x4008;

        let driver = test_driver(pcs, dir.path());
        let mut cd = CheckpointDriver::new(driver);
        cd.run_burst();
        cd.run_burst();

        assert!(cd.driver.state.stack(0).is_empty());
        assert_eq!(cd.driver.state.callstack_underflow_count(), 0);
    }

    #[test]
    fn burst_without_hook_crossing_does_not_rewind() {
        let dir = tempfile::tempdir().unwrap();
        let pcs = vec![0x100u64; (INSN_PER_CKPT + 1) as usize];
        let driver = test_driver(pcs, dir.path());
        let mut cd = CheckpointDriver::new(driver);
        cd.run_burst();

        assert_eq!(cd.driver.guest.pc(0), 0x100);
        assert!(cd.driver.state.stack(0).is_empty());
        assert_eq!(cd.driver.state.timestamp(), INSN_PER_CKPT);
    }
}
