//! Concrete kernel hooks (C5), registered by name against the kernel symbol
//! index and dispatched through [`rvtrace_state::HookTable`].
//!
//! Each hook mirrors one `kf_*` class from the reference profiler: a single
//! `update` call that reads guest registers/memory through the current
//! hart's [`rvtrace_guest::GuestModel`], updates [`rvtrace_state::ProfilerState`],
//! and emits exactly the Perfetto packets the reference implementation does.

use rvtrace_guest::abi_reg_index;
use rvtrace_state::{CallstackEntry, Hook};

use crate::driver::Driver;

/// Offset of `pid` within `struct task_struct`, for the kernel build this
/// profiler targets. Fixed at build time rather than read from DWARF because
/// the reference implementation hardcodes it too.
pub const OFFSET_TASK_STRUCT_PID: u64 = 1072;

const MAX_FILENAME_SIZE: u64 = 200;

pub const FN_DO_EXECVEAT_COMMON: &str = "do_execveat_common.isra.0";
const DO_EXECVEAT_COMMON_FILENAME_ARG: usize = 1;
pub const FN_SET_MM_ASID: &str = "set_mm_asid";
pub const FN_KERNEL_CLONE: &str = "kernel_clone";
pub const FN_PICK_NEXT_TASK_FAIR: &str = "pick_next_task_fair";
pub const FN_FINISH_TASK_SWITCH: &str = "finish_task_switch.isra.0";
const FINISH_TASK_SWITCH_PREV_ARG: usize = 0;

/// Read the pid of the task currently running on hart 0 via the `tp`
/// register (which holds a pointer to the current task's `task_struct`).
fn current_pid(driver: &Driver) -> Option<u32> {
    let tp = abi_reg_index("tp")?;
    let curr_ptr = driver.guest.gpr(0, tp);
    let pid_addr = curr_ptr.checked_add(OFFSET_TASK_STRUCT_PID)?;
    driver.guest.load_u64(0, pid_addr).ok().map(|v| v as u32)
}

pub struct ExecHook;

impl Hook<Driver> for ExecHook {
    fn update(&self, driver: &mut Driver) -> Option<CallstackEntry> {
        let pid = current_pid(driver)?;
        let filepath = find_exec_syscall_filepath(driver)?;
        driver.state.set_pid_bin(pid, filepath.clone());
        driver.emit_instant(FN_DO_EXECVEAT_COMMON);
        Some(CallstackEntry::new(FN_DO_EXECVEAT_COMMON, filepath))
    }

    fn name(&self) -> &str {
        FN_DO_EXECVEAT_COMMON
    }
}

fn find_exec_syscall_filepath(driver: &mut Driver) -> Option<String> {
    let reg_name = driver
        .kernel_symbols()
        .arg_reg(FN_DO_EXECVEAT_COMMON, DO_EXECVEAT_COMMON_FILENAME_ARG)
        .ok()?;
    let reg_idx = abi_reg_index(&reg_name)?;

    let filename_ptr = driver.guest.gpr(0, reg_idx);
    let filename_struct = driver.guest.load_u64(0, filename_ptr).ok()?;

    let mut name = Vec::new();
    let mut offset = 0u64;
    loop {
        let byte = driver.guest.load_u8(0, filename_struct + offset).ok()?;
        if byte == 0 || offset >= MAX_FILENAME_SIZE {
            break;
        }
        name.push(byte);
        offset += 1;
    }
    Some(String::from_utf8_lossy(&name).into_owned())
}

pub struct AsidHook;

impl Hook<Driver> for AsidHook {
    fn update(&self, driver: &mut Driver) -> Option<CallstackEntry> {
        let pid = current_pid(driver).unwrap_or(0);
        let called_by_exec = driver
            .state
            .stack(pid)
            .last()
            .map(|top| top.function_name == FN_DO_EXECVEAT_COMMON)
            .unwrap_or(false);

        if called_by_exec {
            let bin = driver
                .state
                .stack(pid)
                .last()
                .map(|top| top.binary_name.clone())
                .unwrap_or_default();
            let asid = driver.guest.asid(0);
            log::info!("found mapping asid {asid} pid {pid} bin {bin}");
            driver.state.set_asid_bin(asid, bin);
            driver.emit_instant(FN_SET_MM_ASID);

            if pid != driver.state.get_current_pid() {
                log::warn!(
                    "set_mm_asid: profiler current pid {} disagrees with guest pid {pid}",
                    driver.state.get_current_pid()
                );
            }
        }
        Some(CallstackEntry::new(FN_SET_MM_ASID, ""))
    }

    fn name(&self) -> &str {
        FN_SET_MM_ASID
    }
}

pub struct ForkHook;

impl Hook<Driver> for ForkHook {
    fn update(&self, driver: &mut Driver) -> Option<CallstackEntry> {
        let ret_reg = driver.kernel_symbols().ret_reg(FN_KERNEL_CLONE).ok()?;
        let reg_idx = abi_reg_index(&ret_reg)?;
        let new_pid = driver.guest.gpr(0, reg_idx) as u32;
        let parent_pid = current_pid(driver)?;

        driver.state.fork_pid_bin(parent_pid, new_pid, "X");
        log::info!(
            "forked parent {parent_pid} child {new_pid} bin {:?}",
            driver.state.lookup_pid(new_pid)
        );
        driver.emit_instant(FN_KERNEL_CLONE);
        None
    }

    fn name(&self) -> &str {
        FN_KERNEL_CLONE
    }
}

pub struct CfsPickHook;

impl Hook<Driver> for CfsPickHook {
    fn update(&self, driver: &mut Driver) -> Option<CallstackEntry> {
        let ret_reg = driver.kernel_symbols().ret_reg(FN_PICK_NEXT_TASK_FAIR).ok()?;
        let reg_idx = abi_reg_index(&ret_reg)?;
        let next_task_ptr = driver.guest.gpr(0, reg_idx);

        if next_task_ptr == 0 {
            log::info!("CFS has no runnable task, ret reg {ret_reg}");
        } else {
            let pid_addr = next_task_ptr + OFFSET_TASK_STRUCT_PID;
            if let Ok(pid) = driver.guest.load_u64(0, pid_addr) {
                log::debug!("CFS picked next pid {pid}");
            }
        }
        driver.emit_instant(FN_PICK_NEXT_TASK_FAIR);
        None
    }

    fn name(&self) -> &str {
        FN_PICK_NEXT_TASK_FAIR
    }
}

pub struct FinishSwitchHook;

impl Hook<Driver> for FinishSwitchHook {
    fn update(&self, driver: &mut Driver) -> Option<CallstackEntry> {
        let cur_pid = current_pid(driver).unwrap_or(driver.state.get_current_pid());
        let prev_pid = get_prev_pid(driver);
        driver.state.set_current_pid(cur_pid);

        log::info!("context switch finished {prev_pid:?} -> {cur_pid}");

        if let Some(prev_pid) = prev_pid {
            let prev_bin = driver.state.lookup_pid(prev_pid).unwrap_or_default().to_string();
            driver.emit_slice_end(&prev_bin);
        }
        let cur_bin = driver.state.lookup_pid(cur_pid).unwrap_or_default().to_string();
        driver.emit_slice_begin(&cur_bin);

        Some(CallstackEntry::new(FN_FINISH_TASK_SWITCH, ""))
    }

    fn name(&self) -> &str {
        FN_FINISH_TASK_SWITCH
    }
}

fn get_prev_pid(driver: &mut Driver) -> Option<u32> {
    let reg_name = driver
        .kernel_symbols()
        .arg_reg(FN_FINISH_TASK_SWITCH, FINISH_TASK_SWITCH_PREV_ARG)
        .ok()?;
    let reg_idx = abi_reg_index(&reg_name)?;
    let prev_task_ptr = driver.guest.gpr(0, reg_idx);
    if prev_task_ptr == 0 {
        log::error!("prev is null in {FN_FINISH_TASK_SWITCH}");
        return None;
    }
    let pid_addr = prev_task_ptr + OFFSET_TASK_STRUCT_PID;
    driver.guest.load_u64(0, pid_addr).ok().map(|v| v as u32)
}
