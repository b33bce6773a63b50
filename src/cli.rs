use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fleet-manager",
    version,
    about = "Compute Engine fleet manager (reconcile + health)"
)]
pub struct Cli {
    #[arg(short, long, global = true, env = "FLEET_PROFILE")]
    pub profile: Option<String>,
    #[arg(short, long, global = true, env = "FLEET_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(subcommand)]
    Fleet(FleetCommand),
    #[command(subcommand)]
    Firewall(FirewallCommand),
    /// List images available to the profile.
    Images(ImagesArgs),
    /// List persistent disks in the profile zone.
    Disks,
    #[command(subcommand)]
    Operations(OperationsCommand),
}

#[derive(Debug, Subcommand)]
pub enum FleetCommand {
    /// Instances currently belonging to the fleet.
    List(FleetArgs),
    /// Scale the fleet to exactly --count instances.
    Start(FleetStartArgs),
    /// Probe the fleet and print its aggregated health.
    Status(FleetStatusArgs),
    /// Delete every instance of the fleet.
    Stop(FleetStopArgs),
}

#[derive(Debug, Parser)]
pub struct FleetArgs {
    pub fleet: String,
}

#[derive(Debug, Parser)]
pub struct FleetStartArgs {
    pub fleet: String,
    #[arg(long, short = 'n')]
    pub count: usize,
    /// Block until insert/delete operations finish
    #[arg(long)]
    pub wait: bool,
    #[arg(long, default_value = "300")]
    pub timeout_secs: u64,
}

#[derive(Debug, Parser)]
pub struct FleetStatusArgs {
    pub fleet: String,
    /// Per-probe timeout; defaults to the profile's probe_timeout_ms
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Parser)]
pub struct FleetStopArgs {
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub fleet: Option<String>,
    /// Stop every configured fleet
    #[arg(long)]
    pub all: bool,
    #[arg(long, default_value = "300")]
    pub timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum FirewallCommand {
    /// Create the fleet's firewall rule if it does not exist.
    Ensure(FleetArgs),
}

#[derive(Debug, Parser)]
pub struct ImagesArgs {
    /// Image project; defaults to image_project or the profile project
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum OperationsCommand {
    /// Poll operations until they finish.
    Wait(OperationsWaitArgs),
}

#[derive(Debug, Parser)]
pub struct OperationsWaitArgs {
    #[arg(required = true)]
    pub names: Vec<String>,
    /// Zone of zonal operations; defaults to the profile zone
    #[arg(long, conflicts_with = "global")]
    pub zone: Option<String>,
    #[arg(long)]
    pub global: bool,
    #[arg(long, default_value = "300")]
    pub timeout_secs: u64,
}
