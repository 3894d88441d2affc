//! fclient - Command line interface for FATMAN task records.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use fatman_client::{ApiClient, ClientOptions, TaskQuery};
use fatman_core::{join_inside, Task, TaskId, TaskStatus, WorkerId};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// fclient - FATMAN task management tool
#[derive(Parser)]
#[command(name = "fclient")]
#[command(about = "CLI for FATMAN task records", long_about = None, version)]
struct Cli {
    /// The URL where FATMAN is running
    #[arg(long, env = "FATMAN_URL", default_value = "https://tctdb.chem.uzh.ch/fatman")]
    url: String,

    /// Do not verify the server's SSL certificate
    #[arg(long)]
    no_ssl_verify: bool,

    /// Bearer token for the FATMAN API
    #[arg(long, env = "FATMAN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommands),
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks
    List {
        /// Only tasks in this server status (new, pending, running, done, error)
        #[arg(long)]
        status: Vec<String>,

        /// Only tasks claimed by this machine
        #[arg(long)]
        machine: Option<String>,

        /// Maximum number of tasks
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },

    /// Show a task
    Show {
        /// Task ID
        id: String,
    },

    /// List all files associated with the specified task
    #[command(name = "list-files")]
    ListFiles {
        /// Task ID
        id: String,
    },

    /// Download all files of a task into task_<id>/{infiles,outfiles}
    #[command(name = "download-files")]
    DownloadFiles {
        /// Task ID
        id: String,
    },

    /// Upload an artifact for the given task using the specified name
    #[command(name = "upload-artifact")]
    UploadArtifact {
        /// Task ID
        id: String,

        /// File to upload
        filename: PathBuf,

        /// Name of the artifact on the server
        name: String,
    },

    /// Set status of a task
    #[command(name = "set-status")]
    SetStatus {
        /// Task ID
        id: String,

        /// New server status (new, pending, running, done, error)
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let client = ApiClient::with_options(
        &cli.url,
        ClientOptions {
            token: cli.token,
            verify_tls: !cli.no_ssl_verify,
            ..ClientOptions::default()
        },
    )?;

    match cli.command {
        Commands::Task(command) => match command {
            TaskCommands::List {
                status,
                machine,
                limit,
            } => {
                let query = TaskQuery {
                    statuses: parse_statuses(&status)?,
                    machine: machine.map(WorkerId::new),
                    limit: Some(limit),
                };
                list_tasks(&client, &query).await?;
            }
            TaskCommands::Show { id } => {
                let task = client.get_task(&TaskId::new(id)).await?;
                print_task(&task);
            }
            TaskCommands::ListFiles { id } => {
                let task = client.get_task(&TaskId::new(id)).await?;
                for line in file_lines(&task) {
                    println!("{}", line);
                }
            }
            TaskCommands::DownloadFiles { id } => {
                download_files(&client, &TaskId::new(id)).await?;
            }
            TaskCommands::UploadArtifact { id, filename, name } => {
                let task = client.get_task(&TaskId::new(id)).await?;
                client.upload(&task, &name, &filename).await?;
                println!("Uploaded {} as {}", filename.display(), name);
            }
            TaskCommands::SetStatus { id, status } => {
                let status = TaskStatus::from_str(&status)?;
                let task = client.get_task(&TaskId::new(id)).await?;
                let task = client
                    .patch_task(&task, &json!({ "status": status.wire_name() }))
                    .await?;
                println!("Task updated:");
                print_task(&task);
            }
        },
    }

    Ok(())
}

fn parse_statuses(names: &[String]) -> Result<Vec<TaskStatus>, fatman_core::CoreError> {
    names
        .iter()
        .flat_map(|n| n.split(','))
        .filter(|n| !n.is_empty())
        .map(TaskStatus::from_str)
        .collect()
}

async fn list_tasks(client: &ApiClient, query: &TaskQuery) -> Result<(), Box<dyn std::error::Error>> {
    let tasks = client.list_tasks(query).await?;

    println!("Tasks ({}):", tasks.len());
    println!("{:<36}  {:<8}  {:<8}  {:<20}  {}", "ID", "STATUS", "RUNNER", "MACHINE", "CLAIMED");
    println!("{}", "-".repeat(100));

    for task in tasks {
        println!(
            "{:<36}  {:<8}  {:<8}  {:<20}  {}",
            task.id,
            task.status,
            task.kind(),
            task.machine.as_ref().map_or("-", |m| m.as_str()),
            format_timestamp(task.claimed_at)
        );
    }

    Ok(())
}

async fn download_files(client: &ApiClient, id: &TaskId) -> Result<(), Box<dyn std::error::Error>> {
    let task = client.get_task(id).await?;
    let target = PathBuf::from(format!("task_{}", task.id));

    for (direction, files) in [("infiles", &task.infiles), ("outfiles", &task.outfiles)] {
        let dir = target.join(direction);
        std::fs::create_dir_all(&dir)?;

        for file in files {
            let Some(link) = file.links.download.as_deref() else {
                println!("skipping {}: no download link", file.name);
                continue;
            };
            let dest = join_inside(&dir, &file.name)
                .ok_or_else(|| format!("refusing to write '{}' outside of {}", file.name, dir.display()))?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            print!("downloading {} to {}..", file.name, dest.display());
            std::io::stdout().flush()?;
            let bytes = client.download(link, &dest).await?;
            debug!(name = %file.name, bytes, "Downloaded");
            println!(" done");
        }
    }

    Ok(())
}

fn file_lines(task: &Task) -> Vec<String> {
    task.infiles
        .iter()
        .map(|f| format!("-> {}", f.name))
        .chain(task.outfiles.iter().map(|f| format!("<- {}", f.name)))
        .collect()
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Status:     {}", task.status);
    println!("  Runner:     {}", task.kind());
    println!(
        "  Machine:    {}",
        task.machine.as_ref().map_or("-", |m| m.as_str())
    );
    println!("  Claimed:    {}", format_timestamp(task.claimed_at));

    if !task.settings.commands.is_empty() {
        println!("  Commands:");
        for command in &task.settings.commands {
            println!("    {}: {} {}", command.name, command.cmd, command.string_args().join(" "));
        }
    }

    if !task.infiles.is_empty() || !task.outfiles.is_empty() {
        println!("  Files:");
        for line in file_lines(task) {
            println!("    {}", line);
        }
    }

    if let Some(data) = &task.data {
        println!("  Data:");
        match serde_json::to_string_pretty(data) {
            Ok(pretty) => {
                for line in pretty.lines() {
                    println!("    {}", line);
                }
            }
            Err(_) => println!("    {}", data),
        }
    }
}

fn format_timestamp(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}
