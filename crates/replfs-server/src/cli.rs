//! The `rfs` command line.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfig, ReplfsClient};
use crate::config::ServerConfig;
use crate::server::FileServer;

/// Arguments of the `rfs` binary.
#[derive(Parser)]
#[command(name = "rfs")]
#[command(about = "replfs replicated file store", long_about = None)]
pub struct Cli {
    /// File server address used by client commands
    #[arg(short, long, default_value = "127.0.0.1:7070", env = "RFS_SERVER")]
    pub server: String,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the file server
    Serve {
        /// TOML or JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Override the storage root
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Upload a local file
    Upload {
        local: PathBuf,
        /// Destination path, defaults to the local file name
        remote: Option<String>,
    },
    /// Download a file
    Download {
        remote: String,
        local: PathBuf,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Delete a file, or a directory with --dir
    Rm {
        path: String,
        #[arg(short, long)]
        dir: bool,
    },
    /// Move or rename an entry
    Mv { from: String, to: String },
    /// Version history
    Version {
        #[command(subcommand)]
        cmd: VersionCmd,
    },
    /// Replication status of one file or all tracked files
    Status { path: Option<String> },
    /// Replicate a file now
    Replicate {
        path: String,
        #[arg(short, long)]
        factor: Option<usize>,
    },
    /// Cluster health and node table
    Nodes,
    /// Recover one node, or every unhealthy node
    Recover { node_id: Option<String> },
}

/// Version subcommands.
#[derive(Subcommand, Clone)]
pub enum VersionCmd {
    /// Snapshot a file
    Create {
        path: String,
        #[arg(short, long, default_value = "rfs")]
        creator: String,
        #[arg(short = 'm', long, default_value = "")]
        comment: String,
    },
    /// List versions, newest first
    List { path: String },
    /// Restore a version
    Restore { path: String, version_id: String },
}

impl Cli {
    /// Runs the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve {
                ref config,
                bind,
                ref root,
            } => serve(config.clone(), bind, root.clone()).await,
            ref command => {
                let client = ReplfsClient::new(self.server.clone(), ClientConfig::default());
                run_client(&client, command).await
            }
        }
    }
}

async fn serve(config: Option<PathBuf>, bind: Option<SocketAddr>, root: Option<PathBuf>) -> Result<()> {
    let mut config = match config {
        Some(path) => ServerConfig::from_file(&path)?,
        None => {
            tracing::warn!("no config file given, using defaults");
            ServerConfig::default()
        }
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(root) = root {
        config.storage_root = root;
    }

    let server = FileServer::new(config).await?;
    let listener = server.bind().await?;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        token.cancel();
    });
    server.run(listener, shutdown).await?;
    Ok(())
}

async fn run_client(client: &ReplfsClient, command: &Command) -> Result<()> {
    match command {
        Command::Serve { .. } => anyhow::bail!("serve does not talk to a server"),
        Command::Upload { local, remote } => {
            let remote = match remote {
                Some(r) => r.clone(),
                None => local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("cannot derive a remote name from {}", local.display()))?,
            };
            let summary = client.upload_file(local, &remote).await?;
            println!(
                "Uploaded {} ({} bytes, {} chunks, {} resent)",
                summary.path, summary.size, summary.chunks, summary.retransmits
            );
        }
        Command::Download { remote, local } => {
            let bytes = client.download_to(remote, local).await?;
            println!("Downloaded {} to {} ({} bytes)", remote, local.display(), bytes);
        }
        Command::Ls { path } => {
            for entry in client.list_dir(path).await? {
                let kind = if entry.is_dir { "d" } else { "-" };
                let modified = entry
                    .modified
                    .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{} {:>12} {:16} {}", kind, entry.size, modified, entry.name);
            }
        }
        Command::Mkdir { path } => println!("Created {}", client.create_dir(path).await?),
        Command::Rm { path, dir } => {
            let removed = if *dir {
                client.delete_dir(path).await?
            } else {
                client.delete_file(path).await?
            };
            println!("Deleted {}", removed);
        }
        Command::Mv { from, to } => {
            let (from, to) = client.move_entry(from, to).await?;
            println!("Moved {} to {}", from, to);
        }
        Command::Version { cmd } => version(client, cmd).await?,
        Command::Status { path } => {
            for status in client.replication_status(path.as_deref()).await? {
                let nodes: Vec<&str> = status.node_ids.iter().map(|n| n.as_str()).collect();
                println!(
                    "{:40} {:?} {}/{} [{}]",
                    status.path,
                    status.state,
                    status.replica_count(),
                    status.target_factor,
                    nodes.join(", ")
                );
            }
        }
        Command::Replicate { path, factor } => {
            let report = client.force_replication(path, *factor).await?;
            println!(
                "{}: {}/{} replicas, {} new",
                report.path,
                report.replicas,
                report.target_factor,
                report.pushed_to.len()
            );
        }
        Command::Nodes => {
            let (summary, nodes) = client.node_health().await?;
            println!(
                "Nodes: {} total, {} healthy, {} unhealthy ({:.0}%)",
                summary.total_nodes, summary.healthy_nodes, summary.unhealthy_nodes, summary.healthy_percentage
            );
            for node in nodes {
                let health = if node.is_healthy() { "healthy" } else { "UNHEALTHY" };
                println!(
                    "  {:20} {:24} {:9} files={} free={}",
                    node.id,
                    format!("{}:{}", node.address, node.port),
                    health,
                    node.status.hosted_files.len(),
                    node.available_space
                );
            }
        }
        Command::Recover { node_id } => {
            let summary = client.recover(node_id.as_deref()).await?;
            for report in &summary.reports {
                println!(
                    "{}: {}/{} files restored",
                    report.node_id, report.restored, report.files
                );
                for (path, reason) in &report.failed {
                    println!("  failed {}: {}", path, reason);
                }
            }
            for id in &summary.in_cooldown {
                println!("{}: in cooldown", id);
            }
            for id in &summary.already_running {
                println!("{}: recovery already running", id);
            }
        }
    }
    Ok(())
}

async fn version(client: &ReplfsClient, cmd: &VersionCmd) -> Result<()> {
    match cmd {
        VersionCmd::Create {
            path,
            creator,
            comment,
        } => {
            let v = client.create_version(path, creator, comment).await?;
            println!("Created version {} of {} ({} bytes)", v.version_id, v.path, v.size);
        }
        VersionCmd::List { path } => {
            for v in client.list_versions(path).await? {
                println!(
                    "{}  {}  {:>10}  {:12} {}",
                    v.version_id,
                    v.created_at.format("%Y-%m-%d %H:%M:%S"),
                    v.size,
                    v.creator,
                    v.comment
                );
            }
        }
        VersionCmd::Restore { path, version_id } => {
            let (restored, backup) = client.restore_version(path, version_id).await?;
            println!("Restored {} to {}", restored.path, restored.version_id);
            if let Some(b) = backup {
                println!("Previous content saved as {}", b.version_id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from(["rfs", "serve", "--bind", "127.0.0.1:9000", "--root", "/tmp/r"]);
        match cli.command {
            Command::Serve { config, bind, root } => {
                assert!(config.is_none());
                assert_eq!(bind, Some("127.0.0.1:9000".parse().unwrap()));
                assert_eq!(root, Some(PathBuf::from("/tmp/r")));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_version_create() {
        let cli = Cli::parse_from(["rfs", "-s", "h:1", "version", "create", "a.txt", "-m", "note"]);
        assert_eq!(cli.server, "h:1");
        match cli.command {
            Command::Version {
                cmd: VersionCmd::Create { path, creator, comment },
            } => {
                assert_eq!(path, "a.txt");
                assert_eq!(creator, "rfs");
                assert_eq!(comment, "note");
            }
            _ => panic!("expected version create"),
        }
    }

    #[test]
    fn test_parse_replicate_factor() {
        let cli = Cli::parse_from(["rfs", "replicate", "f", "--factor", "2"]);
        assert!(matches!(cli.command, Command::Replicate { factor: Some(2), .. }));
    }

    #[test]
    fn test_parse_rm_dir_flag() {
        let cli = Cli::parse_from(["rfs", "rm", "--dir", "d"]);
        assert!(matches!(cli.command, Command::Rm { dir: true, .. }));
    }
}
