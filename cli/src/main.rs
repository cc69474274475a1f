//! rig CLI: allocate cluster nodes and manage pushed deployments.
//!
//! # Usage
//!
//! ```text
//! rig cluster add perlmutter --host login.hpc.example --user alice --default
//! rig allocate --nodes 2 --cores 16 --memory 32GiB --walltime 2:00:00
//! rig list
//! rig cancel 6f1c0c9e-1d7a-4e55-9c57-1b8f0fb3f2a1
//! rig clear
//! ```

mod client;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use rig_core::rig::allocation::request::{Bytes, Walltime};

/// Obtain nodes from an HPC cluster and keep track of what runs on them.
#[derive(Parser)]
#[command(name = "rig")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Cluster to use instead of the default one
    #[arg(short, long, global = true)]
    cluster: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configured clusters
    #[command(subcommand)]
    Cluster(ClusterCommands),

    /// Request nodes, wait until they run, and push the allocation
    Allocate(AllocateArgs),

    /// Show live pushed deployments
    List,

    /// Cancel a pushed deployment and forget it
    Cancel {
        uuid: uuid::Uuid,
    },

    /// Delete the deployments document
    Clear,

    /// Check that the access node answers
    Check,
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Register a cluster
    Add {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// Private key to authenticate with
        #[arg(long)]
        key: Option<String>,
        /// Working directory on the cluster's shared storage
        #[arg(long)]
        rig_dir: Option<String>,
        /// Make this the default cluster
        #[arg(long)]
        default: bool,
    },
    /// Remove a cluster
    Remove { name: String },
    /// List clusters
    List,
    /// Set the default cluster
    Default { name: String },
}

#[derive(clap::Args)]
struct AllocateArgs {
    #[arg(long)]
    nodes: u32,
    /// Cores per node
    #[arg(long)]
    cores: u32,
    /// Memory per node, e.g. 4GiB or 512MB
    #[arg(long)]
    memory: Bytes,
    /// Time limit, [D-]HH:MM:SS
    #[arg(long)]
    walltime: Walltime,
    /// Extra sbatch option, KEY or KEY=VALUE (repeatable)
    #[arg(long = "native", value_name = "KEY[=VALUE]")]
    native: Vec<String>,
    /// Give up waiting after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}


fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => rig_core::logger::level_from_str(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    rig_core::logger::init(level, cli.log_file.as_deref());

    let config_path = client::resolve_config_path();
    let cluster = cli.cluster.as_deref();
    let result = match cli.command {
        Commands::Cluster(ClusterCommands::Add {
            name,
            host,
            user,
            port,
            key,
            rig_dir,
            default,
        }) => client::cluster_add(
            &config_path,
            client::NewCluster {
                name,
                host,
                user,
                port,
                key,
                rig_dir,
                default,
            },
        ),
        Commands::Cluster(ClusterCommands::Remove { name }) => client::cluster_remove(&config_path, &name),
        Commands::Cluster(ClusterCommands::List) => client::cluster_list(&config_path),
        Commands::Cluster(ClusterCommands::Default { name }) => client::cluster_default(&config_path, &name),
        Commands::Allocate(args) => client::allocate(
            &config_path,
            cluster,
            client::AllocateRequest {
                nodes: args.nodes,
                cores: args.cores,
                memory: args.memory,
                walltime: args.walltime,
                native: args.native,
                timeout: args.timeout,
            },
        ),
        Commands::List => client::list(&config_path, cluster),
        Commands::Cancel { uuid } => client::cancel(&config_path, cluster, uuid),
        Commands::Clear => client::clear(&config_path, cluster),
        Commands::Check => client::check(&config_path, cluster),
    };

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("rig error: {}", e);
            process::exit(1);
        }
    }
}
