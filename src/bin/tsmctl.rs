//! tsmctl - CLI for tsmd
//!
//! Communicates with the tsmd daemon over its control socket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tsm::config::Config;
use tsm::protocol::{call, Request, Response};

#[derive(Parser)]
#[command(name = "tsmctl")]
#[command(about = "Control the tsmd game server supervisor")]
struct Args {
    /// Control socket (defaults to the one in the default config)
    #[arg(long, short = 's', global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping the daemon
    Ping,
    /// Show whether the game server is running
    Status,
    /// List backups, newest first
    List,
    /// Print the archive path of a backup
    Path {
        /// Backup id (see `list`)
        id: u64,
    },
    /// Stop and start the game server
    Restart,
    /// Back up the save now
    Backup {
        /// Comment stored with the backup
        #[arg(short = 'c', long, default_value = "")]
        comment: String,
    },
    /// Replace the save with a backup
    Restore {
        /// Backup id (see `list`)
        id: u64,
    },
    /// Run the configured update command
    Update,
    /// Stop the game server and the daemon
    Shutdown,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    let request = match args.command {
        Command::Ping => Request::Ping,
        Command::Status => Request::Status,
        Command::List => Request::ListBackups,
        Command::Path { id } => Request::BackupPath { id },
        Command::Restart => Request::Restart,
        Command::Backup { comment } => Request::Backup { comment },
        Command::Restore { id } => Request::Restore { id },
        Command::Update => Request::Update,
        Command::Shutdown => Request::Shutdown,
    };

    let sock_path = args.socket.unwrap_or_else(|| Config::default().socket_path);
    log::debug!("Sending {:?} to {}", request, sock_path.display());

    match call(&sock_path, &request).await {
        Ok(response) => print_response(response),
        Err(e) => {
            if e.is_daemon_unreachable() {
                eprintln!("tsmctl: daemon not running at {}", sock_path.display());
                eprintln!("  start with: tsmd");
            } else {
                eprintln!("tsmctl: {}", e);
            }
            std::process::exit(1);
        }
    }
}

fn print_response(response: Response) {
    match response {
        Response::Ok => {} // Silent success
        Response::Pong => println!("pong"),
        Response::Error(msg) => {
            eprintln!("error: {}", msg);
            std::process::exit(1);
        }
        Response::Status { running, status } => {
            let dot = if running { "●" } else { "○" };
            println!("{} game server", dot);
            println!("   Status: {}", status);
        }
        Response::Backups(backups) => {
            if backups.is_empty() {
                println!("No backups");
                return;
            }
            println!("{:>6}  {:<28} {}", "ID", "NAME", "COMMENT");
            for backup in backups {
                println!("{:>6}  {:<28} {}", backup.id, backup.name, backup.comment);
            }
        }
        Response::BackupPath(path) => println!("{}", path.display()),
        Response::BackupCreated(id) => println!("Created backup {}", id),
    }
}
