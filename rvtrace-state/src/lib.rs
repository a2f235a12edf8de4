//! Profiler state (C4) and the kernel-hook table (C5's registration side).
//!
//! Owned exclusively by the driver thread; hooks only ever touch it through
//! the driver that calls them, so none of this needs locking (the invariant
//! holds as long as nobody calls it from more than one thread, which the
//! drivers in `rvtrace` never do).

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use rustc_hash::FxHashMap;

/// One entry in a per-PID call stack: the kernel function that pushed it,
/// and which binary it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallstackEntry {
    pub function_name: String,
    pub binary_name: String,
}

impl CallstackEntry {
    pub fn new(function_name: impl Into<String>, binary_name: impl Into<String>) -> Self {
        CallstackEntry {
            function_name: function_name.into(),
            binary_name: binary_name.into(),
        }
    }
}

/// A hook fires when the driver observes the PC it was registered under.
/// `D` is the concrete driver type (defined by whoever owns the functional
/// model, the symbol index, and the event logger); this crate never needs
/// to know its shape.
///
/// Replaces a polymorphic base-class hierarchy: the driver dispatches
/// through [`HookTable`], not through virtual calls.
pub trait Hook<D> {
    /// Inspect/mutate guest and profiler state, optionally returning a new
    /// call-stack entry for the driver to push (only meaningful for hooks
    /// registered at a function's *start*).
    fn update(&self, driver: &mut D) -> Option<CallstackEntry>;

    /// Name used in the corresponding Perfetto event; defaults to the Rust
    /// type name, but hooks should override it with the kernel symbol name.
    fn name(&self) -> &str;
}

/// start-PC -> hook, and the set of exit PCs registered (optionally with
/// their own at-exit hook). Read-only after initialization.
pub struct HookTable<D> {
    start_hooks: FxHashMap<u64, Box<dyn Hook<D>>>,
    exit_hooks: FxHashMap<u64, Option<Box<dyn Hook<D>>>>,
}

impl<D> Default for HookTable<D> {
    fn default() -> Self {
        HookTable {
            start_hooks: FxHashMap::default(),
            exit_hooks: FxHashMap::default(),
        }
    }
}

impl<D> HookTable<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` to fire when the PC equals `entry_pc` (a function
    /// entry, or an interior point such as a specific CSR write). `exits`
    /// are the PCs that pop the pushed entry back off the stack.
    pub fn register_hook_at_start(
        &mut self,
        entry_pc: u64,
        hook: Box<dyn Hook<D>>,
        exits: impl IntoIterator<Item = u64>,
    ) {
        self.start_hooks.insert(entry_pc, hook);
        for exit in exits {
            self.exit_hooks.entry(exit).or_insert(None);
        }
    }

    /// Register `hook` to fire at each of `exits` without pushing/popping a
    /// call-stack entry (used for hooks that only need the return value).
    pub fn register_hook_at_exit(&mut self, exits: impl IntoIterator<Item = u64>, hook: Box<dyn Hook<D>>)
    where
        D: 'static,
    {
        // Share the boxed hook across every exit PC it's registered for by
        // re-wrapping behind an `Rc`-free approach isn't possible with
        // `Box<dyn Hook<D>>` alone; callers with a single exit PC are the
        // common case, so we accept exactly one hook instance here and
        // require the caller to pass each exit PC once per hook object it
        // constructs when more than one exit exists.
        let mut exits = exits.into_iter();
        if let Some(first) = exits.next() {
            self.exit_hooks.insert(first, Some(hook));
            for extra in exits {
                self.exit_hooks.entry(extra).or_insert(None);
            }
        }
    }

    pub fn started_at(&self, pc: u64) -> Option<&dyn Hook<D>> {
        self.start_hooks.get(&pc).map(|h| h.as_ref())
    }

    pub fn exits_at(&self, pc: u64) -> bool {
        self.exit_hooks.contains_key(&pc)
    }

    pub fn exit_hook_at(&self, pc: u64) -> Option<&dyn Hook<D>> {
        self.exit_hooks.get(&pc).and_then(|h| h.as_deref())
    }

    /// Move a start hook out of the table so the driver can call it with a
    /// `&mut D` without aliasing the table's own borrow. Pair with
    /// [`HookTable::put_start_hook`] once the call returns.
    pub fn take_start_hook(&mut self, pc: u64) -> Option<Box<dyn Hook<D>>> {
        self.start_hooks.remove(&pc)
    }

    pub fn put_start_hook(&mut self, pc: u64, hook: Box<dyn Hook<D>>) {
        self.start_hooks.insert(pc, hook);
    }

    /// Same take/put dance for the optional hook at an exit PC.
    pub fn take_exit_hook(&mut self, pc: u64) -> Option<Box<dyn Hook<D>>> {
        self.exit_hooks.get_mut(&pc).and_then(|slot| slot.take())
    }

    pub fn put_exit_hook(&mut self, pc: u64, hook: Box<dyn Hook<D>>) {
        if let Some(slot) = self.exit_hooks.get_mut(&pc) {
            *slot = Some(hook);
        }
    }

    /// Sorted, registered function-entry PCs (includes CSR-write interception points).
    pub fn start_pcs_to_profile(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.start_hooks.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Sorted union of every hook's registered exit PCs.
    pub fn exit_pcs_to_profile(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.exit_hooks.keys().copied().collect();
        v.sort_unstable();
        v
    }
}

/// Shared mutable profiler state (C4).
pub struct ProfilerState<D> {
    callstacks: FxHashMap<u32, Vec<CallstackEntry>>,
    pid_to_binary: FxHashMap<u32, String>,
    asid_to_binary: FxHashMap<u16, String>,
    current_pid: u32,
    timestamp: u64,
    hooks: HookTable<D>,
    callstack_underflows: u64,
}

impl<D> Default for ProfilerState<D> {
    fn default() -> Self {
        ProfilerState {
            callstacks: FxHashMap::default(),
            pid_to_binary: FxHashMap::default(),
            asid_to_binary: FxHashMap::default(),
            current_pid: 0,
            timestamp: 0,
            hooks: HookTable::new(),
            callstack_underflows: 0,
        }
    }
}

impl<D> ProfilerState<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(&self) -> &HookTable<D> {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookTable<D> {
        &mut self.hooks
    }

    pub fn push(&mut self, pid: u32, entry: CallstackEntry) {
        self.callstacks.entry(pid).or_default().push(entry);
    }

    /// Pop one entry off `pid`'s stack. Popping an empty stack is a known
    /// benign race (the driver's view of `current_pid` lags the functional
    /// model by at most one scheduling decision) and is logged, not fatal.
    pub fn pop(&mut self, pid: u32) -> Option<CallstackEntry> {
        match self.callstacks.get_mut(&pid) {
            Some(stack) if !stack.is_empty() => stack.pop(),
            _ => {
                self.callstack_underflows += 1;
                log::warn!("callstack underflow popping pid {pid}: stack was empty");
                None
            }
        }
    }

    pub fn stack(&self, pid: u32) -> &[CallstackEntry] {
        self.callstacks.get(&pid).map(|s| s.as_slice()).unwrap_or(&[])
    }

    pub fn callstack_underflow_count(&self) -> u64 {
        self.callstack_underflows
    }

    pub fn set_pid_bin(&mut self, pid: u32, binary: impl Into<String>) {
        self.pid_to_binary.insert(pid, binary.into());
    }

    /// Copy the parent's binary to a freshly-forked child PID, per the
    /// `pid -> binary` fork/exec invariant (fork copies, exec overwrites).
    pub fn fork_pid_bin(&mut self, parent: u32, child: u32, placeholder: &str) {
        let binary = self
            .pid_to_binary
            .get(&parent)
            .cloned()
            .unwrap_or_else(|| placeholder.to_string());
        self.pid_to_binary.insert(child, binary);
    }

    pub fn lookup_pid(&self, pid: u32) -> Option<&str> {
        self.pid_to_binary.get(&pid).map(|s| s.as_str())
    }

    pub fn set_asid_bin(&mut self, asid: u16, binary: impl Into<String>) {
        self.asid_to_binary.insert(asid, binary.into());
    }

    pub fn lookup_asid(&self, asid: u16) -> Option<&str> {
        self.asid_to_binary.get(&asid).map(|s| s.as_str())
    }

    pub fn asid_map(&self) -> impl Iterator<Item = (u16, &str)> {
        self.asid_to_binary.iter().map(|(a, b)| (*a, b.as_str()))
    }

    pub fn get_current_pid(&self) -> u32 {
        self.current_pid
    }

    pub fn set_current_pid(&mut self, pid: u32) {
        self.current_pid = pid;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn advance_timestamp(&mut self, n: u64) {
        self.timestamp += n;
    }

    /// Write the ASID mapping dump: one `<asid_dec> <binary_path>` line per
    /// bound ASID.
    pub fn dump_asid2bin_mapping(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut file = File::create(path)?;
        let mut entries: Vec<_> = self.asid_to_binary.iter().collect();
        entries.sort_by_key(|(asid, _)| **asid);
        for (asid, binary) in entries {
            writeln!(file, "{asid} {binary}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyDriver;
    struct NopHook(&'static str);
    impl Hook<DummyDriver> for NopHook {
        fn update(&self, _driver: &mut DummyDriver) -> Option<CallstackEntry> {
            None
        }
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut st: ProfilerState<DummyDriver> = ProfilerState::new();
        st.push(7, CallstackEntry::new("a", "bin"));
        st.push(7, CallstackEntry::new("b", "bin"));
        assert_eq!(st.pop(7).unwrap().function_name, "b");
        assert_eq!(st.pop(7).unwrap().function_name, "a");
        assert!(st.pop(7).is_none());
        assert_eq!(st.callstack_underflow_count(), 1);
    }

    #[test]
    fn fork_copies_parent_binary() {
        let mut st: ProfilerState<DummyDriver> = ProfilerState::new();
        st.set_pid_bin(7, "/bin/hello");
        st.fork_pid_bin(7, 9, "X");
        assert_eq!(st.lookup_pid(9), Some("/bin/hello"));
    }

    #[test]
    fn fork_with_unknown_parent_uses_placeholder() {
        let mut st: ProfilerState<DummyDriver> = ProfilerState::new();
        st.fork_pid_bin(1, 2, "X");
        assert_eq!(st.lookup_pid(2), Some("X"));
    }

    #[test]
    fn exit_pcs_to_profile_is_sorted_union() {
        let mut hooks: HookTable<DummyDriver> = HookTable::new();
        hooks.register_hook_at_start(0x10, Box::new(NopHook("f1")), [0x20, 0x30]);
        hooks.register_hook_at_exit([0x05], Box::new(NopHook("f2")));
        assert_eq!(hooks.exit_pcs_to_profile(), vec![0x05, 0x20, 0x30]);
    }

    #[test]
    fn take_and_put_start_hook_round_trips() {
        let mut hooks: HookTable<DummyDriver> = HookTable::new();
        hooks.register_hook_at_start(0x10, Box::new(NopHook("f1")), []);
        let hook = hooks.take_start_hook(0x10).expect("hook present");
        assert!(hooks.started_at(0x10).is_none());
        assert_eq!(hook.name(), "f1");
        hooks.put_start_hook(0x10, hook);
        assert_eq!(hooks.started_at(0x10).unwrap().name(), "f1");
    }

    #[test]
    fn timestamp_is_monotonic_under_advance() {
        let mut st: ProfilerState<DummyDriver> = ProfilerState::new();
        st.advance_timestamp(5);
        st.advance_timestamp(3);
        assert_eq!(st.timestamp(), 8);
    }
}
