mod checkpoint_driver;
mod cli;
mod config;
mod driver;
mod error;
mod hooks;
mod pc_trace;
mod replay_driver;
mod stop_flag;
mod unwind;

use std::fs;

use clap::Parser;
use rustc_hash::FxHashMap;

use checkpoint_driver::CheckpointDriver;
use cli::{Action, Opt, ProfileArgs, ReplayArgs, UnwindArgs};
use config::ProfilerConfig;
use driver::Driver;
use error::{ProfilerError, ProfilerResult};
use replay_driver::ReplayDriver;
use rvtrace_guest::GuestModel;
use rvtrace_replay::TraceReaderAhead;
use rvtrace_symbols::SymbolIndex;
use stop_flag::StopFlag;
use unwind::{load_asid_map, run_unwind_pass, StackUnwinder, UnwindAdapter};

fn main() {
    env_logger::init();

    let opt = Opt::parse();
    let result = match opt.action {
        Action::Profile(args) => run_profile(args),
        Action::Replay(args) => run_replay(args),
        Action::Unwind(args) => run_unwind(args),
    };

    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn load_symbols(config: &ProfilerConfig) -> ProfilerResult<FxHashMap<String, SymbolIndex>> {
    let mut symbols = FxHashMap::default();
    for spec in &config.objdumps {
        let text = fs::read_to_string(&spec.path).map_err(|err| {
            ProfilerError::Setup(format!(
                "couldn't read objdump {:?} for {:?}: {err}",
                spec.path, spec.name
            ))
        })?;
        let index = SymbolIndex::parse(&text)?;
        symbols.insert(spec.name.clone(), index);
    }
    Ok(symbols)
}

/// Hand off to the functional ISA model. The simulator itself is an external
/// collaborator linked in by the embedder (its FFI surface is out of this
/// crate's scope); this binary can wire up configuration and drive it, but
/// has no simulator of its own to construct one from.
fn connect_guest_model(_config: &ProfilerConfig) -> ProfilerResult<Box<dyn GuestModel>> {
    Err(ProfilerError::Setup(
        "no functional-model backend is linked into this build".to_string(),
    ))
}

/// Hand off to the DWARF-based unwinder. Same story as the functional model:
/// it's an external collaborator this crate only defines the interface for.
fn connect_stack_unwinder(_args: &UnwindArgs) -> ProfilerResult<Box<dyn StackUnwinder>> {
    Err(ProfilerError::Setup(
        "no stack-unwinder backend is linked into this build".to_string(),
    ))
}

fn run_profile(args: ProfileArgs) -> ProfilerResult<()> {
    let config = args.profiler_config();
    let symbols = load_symbols(&config)?;
    let guest = connect_guest_model(&config)?;

    let driver = Driver::new(guest, symbols, &config)?;
    let checkpoint_driver = CheckpointDriver::new(driver);
    let stop = StopFlag::install();
    checkpoint_driver.run(&stop)?;
    Ok(())
}

fn run_replay(args: ReplayArgs) -> ProfilerResult<()> {
    let config = args.profiler_config();
    let replay_config = args.replay_config();
    let symbols = load_symbols(&config)?;
    let guest = connect_guest_model(&config)?;

    let driver = Driver::new(guest, symbols, &config)?;
    let reader = TraceReaderAhead::new(
        replay_config.trace_dir.clone(),
        replay_config.hartid,
        replay_config.reader_buffers,
        replay_config.reader_threads,
    );
    let replay_driver = ReplayDriver::new(driver, reader);
    let stop = StopFlag::install();
    replay_driver.run(&stop)?;
    Ok(())
}

fn run_unwind(args: UnwindArgs) -> ProfilerResult<()> {
    let unwinder = connect_stack_unwinder(&args)?;
    let asid_map = load_asid_map(args.run_dir.join("asid2bin.txt"))?;
    let mut adapter = UnwindAdapter::new(unwinder);
    run_unwind_pass(&args.run_dir, &asid_map, &mut adapter)?;
    adapter.stop();
    Ok(())
}
