/*!
 * kvlock - Lock File Administration
 *
 * Inspect, reset, hold or delete the lock file protecting a resource.
 */

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use kvlock::plugin::resolve_resource;
use kvlock::{
    init_tracing, remove_lock_file, LockConfig, LockKind, LockMode, LockRegistry,
    LockStateSnapshot, OpenFlags, PTHREAD_BACKEND,
};

#[derive(Parser, Debug)]
#[command(name = "kvlock", version, about = "Inspect and administer resource lock files")]
struct Cli {
    /// Resource whose lock file to operate on
    resource: PathBuf,

    /// Lock mode (single, shared, partitioned); default adopts the existing file
    #[arg(long)]
    mode: Option<LockMode>,

    /// Backend name
    #[arg(long, default_value = PTHREAD_BACKEND)]
    backend: String,

    /// Print the lock state
    #[arg(long)]
    dump: bool,

    /// Print the lock state as JSON
    #[arg(long)]
    json: bool,

    /// Reinitialize every lock (only when no process is using the resource)
    #[arg(long)]
    reset: bool,

    /// Take the exclusive lock and hold it for SECS seconds
    #[arg(long, value_name = "SECS")]
    hold: Option<u64>,

    /// Delete the lock file
    #[arg(long)]
    delete: bool,

    /// Resource has no backing file
    #[arg(long)]
    memory_only: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = LockConfig::from_env();

    if cli.delete {
        let removed = remove_lock_file(&config, &cli.resource)?;
        println!(
            "{}: lock file {}",
            cli.resource.display(),
            if removed { "removed" } else { "not present" }
        );
        return Ok(());
    }

    let registry = LockRegistry::with_defaults(config);
    let resource = resolve_resource(&cli.resource)?;
    let mut backend = registry.create(&cli.backend)?;
    let flags = OpenFlags {
        any_locks: cli.mode.is_none(),
        memory_only: cli.memory_only,
        lock_now: false,
    };
    let report = backend.open(
        &resource,
        cli.mode.unwrap_or(LockMode::Single),
        0,
        flags,
    )?;
    info!(
        resource = %resource.display(),
        path = %backend.lock_path(&resource)?.display(),
        created = report.created,
        "lock file opened"
    );

    if cli.reset {
        backend.reset()?;
        println!("{}: all locks reset", resource.display());
    }

    if let Some(secs) = cli.hold {
        let status = backend.lock(LockKind::Exclusive, true, 0)?;
        if status.owner_died() {
            println!("{}: recovered lock from a dead owner", resource.display());
        }
        println!("{}: holding exclusive lock for {}s", resource.display(), secs);
        std::thread::sleep(Duration::from_secs(secs));
        backend.unlock(LockKind::Exclusive)?;
    }

    let acted = cli.reset || cli.hold.is_some();
    if cli.json {
        let state = backend.state()?;
        println!("{}", serde_json::to_string_pretty(&state).into_diagnostic()?);
    } else if cli.dump || !acted {
        print_state(&backend.state()?);
    }

    backend.close();
    Ok(())
}

fn print_state(state: &LockStateSnapshot) {
    let file = &state.file;
    println!("lock file:   {}", file.path.display());
    println!(
        "header:      version {} record {}B registers {} mutexes {} (initialized {})",
        file.version, file.record_size, file.register_count, file.mutex_count, file.mutex_initialized
    );
    println!("registers:   {:?}", file.registers);
    println!(
        "mode:        {} ({} base, {} partitions)",
        state.mode, state.base_count, state.partitions
    );

    for slot in &state.base {
        print_slot("base", slot.index, slot.owner, slot.count);
    }
    print_slot("exclusive", state.exclusive.index, state.exclusive.owner, state.exclusive.count);
    for (partition, slot) in state.slots.iter().enumerate() {
        if slot.owner != 0 {
            print_slot(&format!("part {}", partition), slot.index, slot.owner, slot.count);
        }
    }
    println!(
        "held:        {} of {} partitions",
        state.locked_slots(),
        state.partitions
    );
}

fn print_slot(label: &str, index: usize, owner: u32, count: i32) {
    if owner == 0 {
        println!("{:<12} #{:<5} free", label, index);
    } else {
        println!("{:<12} #{:<5} owner {} count {}", label, index, owner, count);
    }
}
