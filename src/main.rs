//! snapchain CLI - Inspect snapshot chains and VM snapshot trees

use clap::{Parser, Subcommand};
use colored::Colorize;
use snapchain::{
    chain::{self, VolumeSnapshotChain},
    store::{EntityStore, VmSnapshotRecord},
    vmsnapshot, DataStoreRole, Error, InMemoryEntityStore, Result, SnapshotConfig, SnapshotId,
    VmId, VmSnapshotId, VolumeId,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snapchain")]
#[command(about = "Inspect volume snapshot chains and VM snapshot trees", long_about = None)]
#[command(version)]
struct Cli {
    /// Entity store file
    #[arg(long, global = true, default_value = "snapchain.json")]
    store: PathBuf,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List pools, volumes, snapshots and VM snapshots
    List,

    /// Show the delta chains of a volume
    Chain {
        /// Volume id
        volume: String,
        /// Datastore role (primary, image, cache)
        #[arg(long, default_value = "image")]
        role: String,
    },

    /// Show the snapshot tree of a VM
    VmTree {
        /// VM id
        vm: String,
    },

    /// Show whether the next backup of a snapshot would be full or a delta
    PlanBackup {
        /// Snapshot id
        snapshot: String,
    },

    /// Verify chain and VM snapshot invariants
    Check,

    /// Print the effective configuration
    Config,
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

fn cmd_list(store: &InMemoryEntityStore) -> Result<()> {
    info("Datastores:");
    for pool in store.list_pools()? {
        println!("  {:<6} {:<20} {}", pool.id, pool.name, pool.role);
    }

    println!();
    info("Volumes:");
    println!(
        "  {:<6} {:<20} {:<10} {:<8} {:<6} {}",
        "ID", "NAME", "HYPERVISOR", "FORMAT", "POOL", "PATH"
    );
    for volume in store.list_volumes()? {
        if volume.removed.is_some() {
            continue;
        }
        let pool = volume
            .pool_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<6} {:<20} {:<10} {:<8} {:<6} {}",
            volume.id, volume.name, volume.hypervisor, volume.format, pool, volume.path
        );
    }

    println!();
    info("Snapshots:");
    let snapshots: Vec<_> = store
        .list_snapshots()?
        .into_iter()
        .filter(|s| !s.is_removed())
        .collect();
    if snapshots.is_empty() {
        println!("  (no snapshots)");
    }
    for snap in snapshots {
        let backup = match snap.full_backup {
            Some(true) => "full",
            Some(false) => "delta",
            None => "-",
        };
        println!(
            "  {:<6} vol {:<6} {:<20} {:<18} {:<8} {}",
            snap.id,
            snap.volume_id,
            snap.name,
            format!("{:?}", snap.state),
            snap.snapshot_type,
            backup
        );
    }

    println!();
    info("VMs:");
    for vm in store.list_vms()? {
        let count = store.vm_snapshots_for_vm(vm.id)?.len();
        let running = if vm.running { "running" } else { "stopped" };
        println!(
            "  {:<6} {:<20} {:<8} {} snapshot(s)",
            vm.id, vm.name, running, count
        );
    }

    Ok(())
}

fn print_chain_node(chain: &VolumeSnapshotChain, id: SnapshotId, depth: usize) {
    let Some(node) = chain.get(id) else {
        return;
    };
    let path = node.install_path.as_deref().unwrap_or("-");
    println!(
        "  {}{} {:<12} {:<8} {}",
        "  ".repeat(depth),
        id.to_string().bold(),
        format!("{:?}", node.state),
        format_size(node.physical_size),
        path
    );
    for child in chain.children(id) {
        print_chain_node(chain, *child, depth + 1);
    }
}

fn cmd_chain(store: &InMemoryEntityStore, volume: &str, role: &str) -> Result<()> {
    let volume: VolumeId = volume.parse().map_err(Error::Other)?;
    let role: DataStoreRole = role.parse().map_err(Error::Other)?;
    store.volume(volume)?.ok_or(Error::VolumeNotFound(volume))?;

    let chain = VolumeSnapshotChain::load(store, volume, role)?;
    info(&format!("Snapshot chains of volume {} on {} storage:", volume, role));
    if chain.is_empty() {
        println!("  (no snapshots)");
        return Ok(());
    }
    for root in chain.roots() {
        print_chain_node(&chain, root, 0);
    }
    Ok(())
}

fn print_vm_node(
    by_parent: &BTreeMap<Option<VmSnapshotId>, Vec<&VmSnapshotRecord>>,
    node: &VmSnapshotRecord,
    depth: usize,
) {
    let mut label = format!("{} {}", node.id.to_string().bold(), node.name);
    if node.current {
        label = format!("{} {}", label, "(current)".green());
    }
    if node.state == snapchain::state::VmSnapshotState::Hidden {
        label = format!(
            "{} {}",
            label,
            format!("(hidden, {})", format_size(node.physical_size)).dimmed()
        );
    }
    println!("  {}{} [{}]", "  ".repeat(depth), label, node.kind);
    for child in by_parent.get(&Some(node.id)).into_iter().flatten() {
        print_vm_node(by_parent, child, depth + 1);
    }
}

fn cmd_vm_tree(store: &InMemoryEntityStore, vm: &str) -> Result<()> {
    let vm: VmId = vm.parse().map_err(Error::Other)?;
    let record = store.vm(vm)?.ok_or(Error::VmNotFound(vm))?;
    let snapshots = store.vm_snapshots_for_vm(vm)?;

    info(&format!("Snapshot tree of VM {} ({}):", record.id, record.name));
    if snapshots.is_empty() {
        println!("  (no snapshots)");
        return Ok(());
    }

    let known: Vec<_> = snapshots.iter().map(|s| s.id).collect();
    let mut by_parent: BTreeMap<Option<VmSnapshotId>, Vec<&VmSnapshotRecord>> = BTreeMap::new();
    for snap in &snapshots {
        let parent = snap.parent.filter(|p| known.contains(p));
        by_parent.entry(parent).or_default().push(snap);
    }
    for root in by_parent.get(&None).into_iter().flatten() {
        print_vm_node(&by_parent, root, 0);
    }
    Ok(())
}

fn cmd_plan_backup(store: &InMemoryEntityStore, config: &SnapshotConfig, id: &str) -> Result<()> {
    let id: SnapshotId = id.parse().map_err(Error::Other)?;
    let snapshot = store.snapshot(id)?.ok_or(Error::SnapshotNotFound(id))?;
    let volume = store
        .volume(snapshot.volume_id)?
        .ok_or(Error::VolumeNotFound(snapshot.volume_id))?;

    let plan = chain::plan_backup(store, config, &snapshot, &volume)?;
    if plan.full_backup {
        success(&format!("Snapshot {} would be backed up in full", id));
    } else {
        let parent = plan
            .parent
            .as_ref()
            .map(|p| p.snapshot_id.to_string())
            .unwrap_or_else(|| "-".into());
        success(&format!(
            "Snapshot {} would be backed up as a delta on snapshot {}",
            id, parent
        ));
    }
    info(&format!(
        "Existing chain depth: {} (limit {})",
        plan.chain_depth,
        config.delta_max()
    ));
    if let Some(stale) = plan.stale_primary_ref {
        warn(&format!(
            "Primary reference {} is left on a previous pool and would be purged",
            stale
        ));
    }
    Ok(())
}

fn cmd_check(store: &InMemoryEntityStore) -> Result<()> {
    let mut violations = 0;

    for volume in store.list_volumes()? {
        for role in [DataStoreRole::Primary, DataStoreRole::Image] {
            let chain = VolumeSnapshotChain::load(store, volume.id, role)?;
            for orphan in chain.dangling() {
                warn(&format!(
                    "Snapshot {} on {} storage of volume {} has no live parent",
                    orphan, role, volume.id
                ));
                violations += 1;
            }
        }
    }

    let vms: Vec<_> = store.list_vms()?.into_iter().map(|vm| vm.id).collect();
    for (vm, count) in vmsnapshot::current_violations(store, &vms)? {
        warn(&format!("VM {} has {} current snapshots", vm, count));
        violations += 1;
    }

    if violations > 0 {
        return Err(Error::Other(format!("{} violation(s) found", violations)));
    }
    success("All chains and VM snapshot trees are consistent");
    Ok(())
}

fn cmd_config(config: &SnapshotConfig) -> Result<()> {
    info("Effective configuration:");
    for key in SnapshotConfig::KEYS {
        println!("  {:<36} {}", key, config.get(key)?);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SnapshotConfig> {
    match path {
        Some(path) => SnapshotConfig::load(path),
        None => Ok(SnapshotConfig::default()),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let store = InMemoryEntityStore::load(&cli.store)?;

    match cli.command {
        None | Some(Commands::List) => cmd_list(&store),
        Some(Commands::Chain { volume, role }) => cmd_chain(&store, &volume, &role),
        Some(Commands::VmTree { vm }) => cmd_vm_tree(&store, &vm),
        Some(Commands::PlanBackup { snapshot }) => cmd_plan_backup(&store, &config, &snapshot),
        Some(Commands::Check) => cmd_check(&store),
        Some(Commands::Config) => cmd_config(&config),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
