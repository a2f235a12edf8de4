//! Interfaces to the external RISC-V functional model ("the ISA simulator").
//!
//! Nothing in this crate implements an instruction-set simulator. It only
//! describes the shape of the collaborator the rest of the profiler talks
//! to: advancing architectural state, reading guest memory and registers,
//! and taking/restoring checkpoints. A real functional model (or a test
//! double) implements [`GuestModel`].

use std::fmt;

use thiserror::Error;

/// RISC-V privilege levels as encoded in `mstatus`/`sstatus` (U=0, S=1, M=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    User,
    Supervisor,
    Machine,
}

impl Privilege {
    pub fn from_encoded(value: u8) -> Option<Self> {
        match value {
            0 => Some(Privilege::User),
            1 => Some(Privilege::Supervisor),
            3 => Some(Privilege::Machine),
            _ => None,
        }
    }

    pub fn encoded(self) -> u8 {
        match self {
            Privilege::User => 0,
            Privilege::Supervisor => 1,
            Privilege::Machine => 3,
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Privilege::User => "U",
            Privilege::Supervisor => "S",
            Privilege::Machine => "M",
        };
        f.write_str(s)
    }
}

/// The 32 integer ABI register names, in canonical (x0..x31) order.
pub const ABI_IREGS: [&str; 32] = [
    "x0", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

/// Resolve an ABI register name (e.g. `"a0"`, `"tp"`) to its architectural index.
pub fn abi_reg_index(name: &str) -> Option<usize> {
    ABI_IREGS.iter().position(|&r| r == name)
}

/// One retired instruction, as produced by a bulk [`GuestModel::run_for`] call.
///
/// This is the functional-mode per-instruction record (§3 "Guest step record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStep {
    pub pc: u64,
    pub asid: u16,
    pub privilege: Privilege,
    pub previous_privilege: Privilege,
    pub raw_instruction_bits: u32,
    pub cycle: u64,
}

/// One record from a pre-recorded cycle-accurate (RTL-level) trace, used to
/// cross-check the functional model in replay mode (§3 "Validation step record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationStep {
    pub valid: bool,
    pub time: u64,
    pub pc: u64,
    pub raw_instruction_bits: u32,
    pub had_exception: bool,
    pub had_interrupt: bool,
    pub cause: u64,
    pub writes_register: bool,
    pub write_data: u64,
    pub privilege: Privilege,
    pub done_flag: bool,
}

/// The outcome of a single functional-model step.
///
/// Replaces the original's control flow of throwing typed C++ exceptions
/// (`PC_SERIALIZE_BEFORE`, `wait_for_interrupt_t`) out of the step routine;
/// the driver matches on this instead of catching anything.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The instruction retired normally.
    Advanced(GuestStep),
    /// The model wants to be checkpointed before this instruction executes
    /// (used around instructions with externally-visible side effects).
    SerializeBefore,
    /// The model wants to be checkpointed right after this instruction.
    SerializeAfter(GuestStep),
    /// The hart entered a wait-for-interrupt state and made no progress.
    WaitForInterrupt,
    /// The instruction trapped (exception or interrupt delivery).
    Trapped(TrapInfo),
    /// A simulator-level debug breakpoint fired.
    DebugBreakpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo {
    pub cause: u64,
    pub tval: u64,
    pub pc: u64,
}

/// An architectural register write produced by one step, reported so that
/// replay mode can overwrite it with a trace-authoritative value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchWrite {
    pub reg: &'static str,
    pub is_fp_or_vector: bool,
    /// Name of the CSR read that produced this write, if the write came from
    /// a `csrr*` instruction (e.g. `"mcycle"`). `None` for ordinary ALU/load writes.
    pub csr_source: Option<&'static str>,
    pub value: u64,
}

/// A memory store produced by one step (used to detect CLINT MSIP/MTIMECMP clears).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStore {
    pub addr: u64,
    pub value: u64,
    pub size_bytes: u8,
}

/// Everything the ganged-step cross-checker (C7) needs about one step beyond
/// the resulting PC.
#[derive(Debug, Clone, Default)]
pub struct StepEffects {
    pub writes: Vec<ArchWrite>,
    pub stores: Vec<MemStore>,
}

/// Interrupt cause bits the driver can assert in `mip` before stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    Msip,
    Mtip,
    Meip,
    Seip,
}

/// An opaque, serializable snapshot of the whole functional model: per-hart
/// architectural state, CLINT/PLIC state, and (optionally) dirtied memory
/// pages. Produced and consumed only by [`GuestModel`]; the driver never
/// looks inside it, only compares it for the idempotence property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Checkpoint(pub Vec<u8>);

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("guest memory fault at 0x{0:x}: page not mapped")]
    MemoryFault(u64),
    #[error("register index {0} out of range")]
    InvalidRegister(usize),
    #[error("csr {0} not implemented by the functional model")]
    UnknownCsr(&'static str),
    #[error("PLIC has no pending external interrupt to assert")]
    PlicOutOfPending,
}

/// The external functional ISA model. Only its interface is specified here;
/// a real implementation wraps the actual simulator.
pub trait GuestModel {
    fn hart_count(&self) -> usize;

    fn pc(&self, hart: usize) -> u64;
    fn asid(&self, hart: usize) -> u16;
    fn privilege(&self, hart: usize) -> Privilege;

    fn gpr(&self, hart: usize, reg_index: usize) -> u64;
    fn set_gpr(&mut self, hart: usize, reg_index: usize, value: u64);

    fn load_u8(&self, hart: usize, va: u64) -> Result<u8, GuestError>;
    fn load_u64(&self, hart: usize, va: u64) -> Result<u64, GuestError>;

    /// Advance `hart` by exactly one instruction. `want` is `None` for
    /// ordinary functional-mode single-stepping, or `Some` effects the
    /// caller wants reported for ganged cross-checking.
    fn step(&mut self, hart: usize) -> StepOutcome;

    /// Like [`GuestModel::step`] but also returns the architectural writes
    /// and memory stores produced, for replay-mode cross-checking.
    fn step_with_effects(&mut self, hart: usize) -> (StepOutcome, StepEffects);

    /// Advance `hart` by up to `count` instructions, collecting every
    /// retired step. Used for the C6 bulk "burst".
    fn run_for(&mut self, hart: usize, count: u64) -> Vec<GuestStep>;

    fn target_running(&self) -> bool;

    fn checkpoint(&self) -> Checkpoint;
    fn restore(&mut self, checkpoint: &Checkpoint);

    /// Patch the pending-interrupt register to reflect `cause`, used by
    /// replay-mode ganged stepping. Returns an error if `cause` is
    /// [`InterruptCause::Seip`] and the PLIC (after one device tick) still
    /// has nothing pending.
    fn assert_interrupt(&mut self, hart: usize, cause: InterruptCause) -> Result<(), GuestError>;

    /// Clear any wait-for-interrupt latch so WFI semantics don't stall the
    /// hart during replay.
    fn clear_wfi(&mut self, hart: usize);

    /// Lower the MIP bit for `cause`, used when replay observes a logged
    /// store clearing the CLINT's MSIP/MTIMECMP registers.
    fn lower_interrupt(&mut self, hart: usize, cause: InterruptCause);

    /// Poll the guest's tohost MMIO word (HTIF-style syscall proxying),
    /// servicing it if set. Returns `true` if a request was handled.
    fn poll_tohost(&mut self) -> bool;
}
