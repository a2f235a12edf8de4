//! Trace-driven driver (C7): steps the functional model one instruction at a
//! time under a pre-recorded cycle-accurate trace, cross-checking ("ganged
//! stepping") every architectural write the model produces against the
//! trace's authoritative values.

use rvtrace_guest::{ArchWrite, GuestStep, InterruptCause, MemStore, StepOutcome, ValidationStep};
use rvtrace_guest::abi_reg_index;
use rvtrace_replay::TraceReaderAhead;

use crate::config::{SPIKE_LOG_FLUSH_PERIOD, TOHOST_POLL_PERIOD};
use crate::driver::Driver;
use crate::error::{ProfilerError, ProfilerResult};
use crate::stop_flag::StopFlag;

/// Standard CLINT device layout (SiFive/Spike): MSIP registers start at
/// offset 0, one 4-byte word per hart; MTIMECMP registers start at 0x4000,
/// one 8-byte word per hart.
const CLINT_MSIP_BASE: u64 = 0x0000;
const CLINT_MTIMECMP_BASE: u64 = 0x4000;
const CLINT_MTIME_BASE: u64 = 0xbff8;

/// CSRs whose value the functional model cannot be trusted to predict
/// (timers, performance counters, and anything hardware-identity or
/// debug-trigger related); ganged stepping always takes the trace's value
/// for a read of one of these instead of the model's own.
fn is_csr_override(name: &str) -> bool {
    matches!(
        name,
        "misa"
            | "mcause"
            | "mtval"
            | "mcycle"
            | "cycle"
            | "time"
            | "instret"
            | "minstret"
            | "satp"
            | "tselect"
            | "mcontext"
    ) || name.starts_with("pmpaddr")
        || name.ends_with("vendorid")
        || name.ends_with("archid")
        || name.ends_with("impid")
}

fn clint_clears(store: &MemStore) -> Option<InterruptCause> {
    if store.addr >= CLINT_MSIP_BASE && store.addr < CLINT_MTIMECMP_BASE && store.value == 0 {
        Some(InterruptCause::Msip)
    } else if store.addr >= CLINT_MTIMECMP_BASE && store.addr < CLINT_MTIME_BASE {
        Some(InterruptCause::Mtip)
    } else {
        None
    }
}

pub struct ReplayDriver {
    driver: Driver,
    reader: TraceReaderAhead,
    hart: usize,
}

impl ReplayDriver {
    pub fn new(driver: Driver, reader: TraceReaderAhead) -> Self {
        ReplayDriver {
            driver,
            reader,
            hart: 0,
        }
    }

    pub fn run(mut self, stop: &StopFlag) -> ProfilerResult<Driver> {
        let mut retired = 0u64;
        'chunks: while let Some(records) = self.reader.next_chunk() {
            for record in &records {
                if stop.is_set() {
                    break 'chunks;
                }
                if !record.valid {
                    continue;
                }
                if retired % TOHOST_POLL_PERIOD == 0 {
                    self.driver.guest.poll_tohost();
                }
                self.ganged_step(record)?;
                retired += 1;
                if retired % SPIKE_LOG_FLUSH_PERIOD == 0 {
                    self.driver.flush_events();
                }
            }
        }
        self.driver.finish()?;
        Ok(self.driver)
    }

    fn ganged_step(&mut self, record: &ValidationStep) -> ProfilerResult<()> {
        if record.had_interrupt {
            let cause = interrupt_cause_from_mip_bits(record.cause);
            self.driver
                .guest
                .assert_interrupt(self.hart, cause)
                .map_err(assert_interrupt_error)?;
        }
        self.driver.guest.clear_wfi(self.hart);

        let (outcome, effects) = self.driver.guest.step_with_effects(self.hart);
        let actual_pc = resulting_pc(&outcome, &mut self.driver, self.hart);

        if actual_pc != record.pc {
            return Err(ProfilerError::GangedDivergence(record.pc, actual_pc));
        }

        self.apply_overrides(&effects.writes, record);
        self.apply_clint_clears(&effects.stores);

        let asid = self.driver.guest.asid(self.hart);
        let prv = record.privilege.encoded();
        self.driver.record_step(actual_pc, asid, prv, prv);
        if !self.driver.fire_start_hook(actual_pc) {
            self.driver.fire_exit_hook(actual_pc);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, writes: &[ArchWrite], record: &ValidationStep) {
        if !record.writes_register {
            return;
        }
        for write in writes {
            if write.is_fp_or_vector {
                continue;
            }
            let overridden = write.csr_source.map(is_csr_override).unwrap_or(false);
            if !overridden {
                continue;
            }
            if let Some(reg_idx) = abi_reg_index(write.reg) {
                self.driver
                    .guest
                    .set_gpr(self.hart, reg_idx, record.write_data);
            }
        }
    }

    fn apply_clint_clears(&mut self, stores: &[MemStore]) {
        for store in stores {
            if let Some(cause) = clint_clears(store) {
                self.driver.guest.lower_interrupt(self.hart, cause);
            }
        }
    }
}

/// §7 gives PLIC-out-of-pending its own fatal error kind, distinct from the
/// generic hook-memory-fault bucket.
fn assert_interrupt_error(source: rvtrace_guest::GuestError) -> ProfilerError {
    match source {
        rvtrace_guest::GuestError::PlicOutOfPending => ProfilerError::PlicOutOfPending,
        source => ProfilerError::HookMemoryFault {
            hook: "ganged_step:assert_interrupt",
            pid: None,
            source,
        },
    }
}

/// MIP cause bits (bit positions per the privileged spec): MSIP=3, MTIP=7,
/// MEIP=11, SEIP=9. The trace's `cause` field carries the architectural
/// exception-code, which for interrupts is the bit position itself.
fn interrupt_cause_from_mip_bits(cause: u64) -> InterruptCause {
    match cause {
        3 => InterruptCause::Msip,
        7 => InterruptCause::Mtip,
        9 => InterruptCause::Seip,
        11 => InterruptCause::Meip,
        _ => InterruptCause::Meip,
    }
}

fn resulting_pc(outcome: &StepOutcome, driver: &mut Driver, hart: usize) -> u64 {
    match outcome {
        StepOutcome::Advanced(GuestStep { pc, .. }) | StepOutcome::SerializeAfter(GuestStep { pc, .. }) => *pc,
        StepOutcome::Trapped(trap) => trap.pc,
        StepOutcome::SerializeBefore | StepOutcome::WaitForInterrupt | StepOutcome::DebugBreakpoint => {
            driver.guest.pc(hart)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_override_set_covers_timers_and_identity_csrs() {
        assert!(is_csr_override("mcycle"));
        assert!(is_csr_override("pmpaddr12"));
        assert!(is_csr_override("mvendorid"));
        assert!(!is_csr_override("a0"));
    }

    #[test]
    fn clint_clear_detects_msip_and_mtimecmp_regions() {
        let msip_clear = MemStore {
            addr: 0x0004,
            value: 0,
            size_bytes: 4,
        };
        assert_eq!(clint_clears(&msip_clear), Some(InterruptCause::Msip));

        let mtimecmp_write = MemStore {
            addr: 0x4000,
            value: 0xffff_ffff,
            size_bytes: 8,
        };
        assert_eq!(clint_clears(&mtimecmp_write), Some(InterruptCause::Mtip));

        let unrelated = MemStore {
            addr: 0x1000_0000,
            value: 1,
            size_bytes: 4,
        };
        assert_eq!(clint_clears(&unrelated), None);
    }

    #[test]
    fn plic_out_of_pending_maps_to_its_own_fatal_kind() {
        assert!(matches!(
            assert_interrupt_error(rvtrace_guest::GuestError::PlicOutOfPending),
            ProfilerError::PlicOutOfPending
        ));
        assert!(matches!(
            assert_interrupt_error(rvtrace_guest::GuestError::InvalidRegister(3)),
            ProfilerError::HookMemoryFault { .. }
        ));
    }

    #[test]
    fn interrupt_cause_maps_known_mip_bits() {
        assert_eq!(interrupt_cause_from_mip_bits(3), InterruptCause::Msip);
        assert_eq!(interrupt_cause_from_mip_bits(7), InterruptCause::Mtip);
        assert_eq!(interrupt_cause_from_mip_bits(9), InterruptCause::Seip);
    }
}
