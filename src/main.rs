//! agentmesh - Distributed coordination layer for agent fleets
//!
//! Main entry point for the agentmesh CLI.

use agentmesh::config::{validate_config, MeshConfig};
use agentmesh::decision::{
    DecisionStatus, EscalationStatus, Sweeper, Tier, Vote, Voter,
};
use agentmesh::keys::Channel;
use agentmesh::message::{AgentMessage, MessageKind, Priority};
use agentmesh::server::MeshServer;
use agentmesh::Mesh;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use meshstore::MemoryStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// agentmesh - coordination for fleets of autonomous agents
#[derive(Parser, Debug)]
#[command(name = "agentmesh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/agentmesh/config.yaml)
    #[arg(short, long, global = true, env = "AGENTMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the coordination store and the HTTP API
    Serve {
        /// Listen address (default: server.bind from config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Do not run the decision timeout sweeper in this process
        #[arg(long)]
        no_sweeper: bool,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Work with agent task queues
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Publish a message on a channel
    Publish {
        /// Channel (head, clevel, broadcast, orchestrator, agent:<id>)
        channel: String,

        /// JSON payload
        payload: String,

        /// Message type (e.g. direct, broadcast, status_update)
        #[arg(short, long, default_value = "direct")]
        kind: String,

        /// Sender name
        #[arg(short, long, default_value = "cli")]
        from: String,

        /// Priority (low, normal, high, urgent)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Pub/sub only, without the stream copy
        #[arg(long)]
        best_effort: bool,
    },

    /// Inspect and resolve decisions
    #[command(subcommand)]
    Decision(DecisionCommands),

    /// Handle human escalations
    #[command(subcommand)]
    Escalation(EscalationCommands),

    /// Run one decision timeout sweep
    Sweep,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Add a task to an agent's queue
    Enqueue {
        agent: String,
        /// JSON payload
        payload: String,
    },

    /// Claim tasks for processing
    Claim {
        agent: String,
        /// Number of tasks (default: queue.claim_batch from config)
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Acknowledge finished tasks by id
    Ack {
        agent: String,
        #[arg(required = true)]
        task_ids: Vec<String>,
    },

    /// Return unacknowledged tasks to the queue
    Recover { agent: String },

    /// Show queue and processing depth
    Depth { agent: String },

    /// Add a task to the urgent lane
    Urgent {
        /// JSON payload
        payload: String,
    },

    /// Move the oldest urgent task onto an agent's queue
    Route { agent: String },
}

#[derive(Subcommand, Debug)]
enum DecisionCommands {
    /// List decisions
    List {
        /// Filter by status (pending, approved, rejected, escalated)
        #[arg(short, long)]
        status: Option<DecisionStatus>,
    },

    /// Show one decision
    Show { id: String },

    /// Propose a decision
    Propose {
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Proposing agent
        #[arg(short, long)]
        proposer: String,

        /// minor, major or critical
        #[arg(short, long, default_value = "minor")]
        tier: Tier,
    },

    /// Vote on a pending decision
    Vote {
        id: String,
        /// ceo or dao
        voter: Voter,
        /// approve or veto
        vote: Vote,
    },

    /// Approve a decision by hand
    Approve {
        id: String,
        #[arg(short, long)]
        by: String,
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Reject a decision by hand
    Reject {
        id: String,
        #[arg(short, long)]
        by: String,
        #[arg(short, long)]
        note: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum EscalationCommands {
    /// List escalations
    List {
        /// Filter by status (pending, responded, timeout)
        #[arg(short, long)]
        status: Option<EscalationStatus>,
    },

    /// Answer an escalation
    Respond {
        id: String,

        /// Approve the decision
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the decision
        #[arg(long)]
        reject: bool,

        #[arg(short, long)]
        response: String,

        #[arg(long)]
        responder: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = agentmesh::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config(cmd) => handle_config_command(cmd, config_path),
        Commands::Serve { bind, no_sweeper } => {
            serve(load_config(config_path)?, bind, no_sweeper).await
        }
        Commands::Queue(cmd) => {
            handle_queue_command(cmd, Mesh::connect(load_config(config_path)?)?).await
        }
        Commands::Publish {
            channel,
            payload,
            kind,
            from,
            priority,
            best_effort,
        } => {
            let channel: Channel = channel.parse().map_err(anyhow::Error::msg)?;
            let kind: MessageKind = serde_json::from_value(serde_json::Value::String(kind.clone()))
                .with_context(|| format!("Unknown message type: {}", kind))?;
            let message = AgentMessage::new(kind, from, channel.to_string(), parse_json(&payload)?)
                .with_priority(priority);

            let mesh = Mesh::connect(load_config(config_path)?)?;
            if best_effort {
                let receivers = mesh.bus.publish(&channel.pubsub(), &message).await?;
                println!("Published {} to {} subscriber(s)", message.id, receivers);
            } else {
                let report = mesh.bus.send(&channel, &message).await?;
                print_json(&report)?;
            }
            Ok(())
        }
        Commands::Decision(cmd) => {
            let mesh = Mesh::connect(load_config(config_path)?)?.with_default_decisions()?;
            handle_decision_command(cmd, &mesh).await
        }
        Commands::Escalation(cmd) => {
            let mesh = Mesh::connect(load_config(config_path)?)?.with_default_decisions()?;
            handle_escalation_command(cmd, &mesh).await
        }
        Commands::Sweep => {
            let mesh = Mesh::connect(load_config(config_path)?)?.with_default_decisions()?;
            let report = coordinator(&mesh)?.sweep(chrono::Utc::now()).await?;
            print_json(&report)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MeshConfig> {
    let config = MeshConfig::load_or_default(path)?;
    tracing::debug!(backend = ?config.store.backend, "Configuration loaded");
    Ok(config)
}

fn parse_json(payload: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(payload).with_context(|| format!("Payload is not valid JSON: {}", payload))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn coordinator(mesh: &Mesh) -> anyhow::Result<&Arc<agentmesh::decision::DecisionCoordinator>> {
    mesh.decisions()
        .context("Decision coordinator is not configured")
}

async fn serve(config: MeshConfig, bind: Option<String>, no_sweeper: bool) -> anyhow::Result<()> {
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("  - {}", error);
        }
        bail!("Invalid configuration ({} problem(s))", errors.len());
    }

    let addr = bind.unwrap_or_else(|| config.server.bind.clone());
    let sweep_interval = config.decisions.sweep_interval;

    // This process hosts the store, so it uses it directly
    let store: agentmesh::store::SharedStore = Arc::new(MemoryStore::new());
    let mesh = Arc::new(Mesh::new(config, store).with_default_decisions()?);
    let server = MeshServer::new(mesh.clone());

    println!("agentmesh listening on http://{}", addr);

    if no_sweeper {
        tokio::select! {
            result = server.run(&addr) => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
            }
        }
        return Ok(());
    }

    let mut sweeper = Sweeper::new(coordinator(&mesh)?.clone(), sweep_interval);
    tokio::select! {
        result = server.run(&addr) => result?,
        // Stops on SIGTERM/SIGINT
        result = sweeper.run() => result?,
    }
    Ok(())
}

fn handle_config_command(cmd: ConfigCommands, path: Option<&Path>) -> anyhow::Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(MeshConfig::default_path);

    match cmd {
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "Config file already exists: {}\nUse --force to overwrite it.",
                    path.display()
                );
            }
            MeshConfig::new().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommands::Show => {
            let config = MeshConfig::load_or_default(Some(&path))?;
            print!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigCommands::Validate => {
            let config = MeshConfig::load_or_default(Some(&path))?;
            match validate_config(&config) {
                Ok(()) => println!("Configuration is valid: {}", path.display()),
                Err(errors) => {
                    println!("Found {} problem(s) in {}:", errors.len(), path.display());
                    for error in &errors {
                        println!("  - {}", error);
                    }
                    bail!("Invalid configuration");
                }
            }
        }
    }
    Ok(())
}

async fn handle_queue_command(cmd: QueueCommands, mesh: Mesh) -> anyhow::Result<()> {
    let queue = &mesh.queue;
    match cmd {
        QueueCommands::Enqueue { agent, payload } => {
            let task = queue.enqueue(&agent, parse_json(&payload)?).await?;
            print_json(&task)?;
        }
        QueueCommands::Claim { agent, count } => {
            let count = count.unwrap_or(mesh.config().queue.claim_batch);
            let claimed = queue.claim(&agent, count).await?;
            let tasks: Vec<_> = claimed.into_iter().map(|c| c.task).collect();
            print_json(&tasks)?;
        }
        QueueCommands::Ack { agent, task_ids } => {
            let removed = queue.acknowledge_ids(&agent, &task_ids).await?;
            println!("Acknowledged {} of {} task(s)", removed, task_ids.len());
        }
        QueueCommands::Recover { agent } => {
            let moved = queue.recover(&agent).await?;
            println!("Recovered {} task(s) for {}", moved, agent);
        }
        QueueCommands::Depth { agent } => {
            let depth = queue.depth(&agent).await?;
            println!("Queue depth for {}:", agent);
            println!("  Queued:      {}", depth.queued);
            println!("  Processing:  {}", depth.processing);
        }
        QueueCommands::Urgent { payload } => {
            let task = queue.enqueue_urgent(parse_json(&payload)?).await?;
            print_json(&task)?;
            println!("Urgent lane depth: {}", queue.urgent_depth().await?);
        }
        QueueCommands::Route { agent } => match queue.route_urgent(&agent).await? {
            Some(task) => print_json(&task)?,
            None => println!("Urgent lane is empty"),
        },
    }
    Ok(())
}

async fn handle_decision_command(cmd: DecisionCommands, mesh: &Mesh) -> anyhow::Result<()> {
    let coordinator = coordinator(mesh)?;
    match cmd {
        DecisionCommands::List { status } => {
            let decisions = coordinator.list(status).await?;
            println!("Found {} decisions:", decisions.len());
            println!();
            for d in decisions {
                println!(
                    "{}  [{:<8}] {:<9} {} (by {}, veto round {})",
                    d.id,
                    d.tier.as_str(),
                    d.status.as_str(),
                    d.title,
                    d.proposer,
                    d.veto_round
                );
            }
        }
        DecisionCommands::Show { id } => print_json(&coordinator.get(&id).await?)?,
        DecisionCommands::Propose {
            title,
            description,
            proposer,
            tier,
        } => {
            let decision = coordinator
                .propose(&title, &description, &proposer, tier)
                .await?;
            print_json(&decision)?;
        }
        DecisionCommands::Vote { id, voter, vote } => {
            print_json(&coordinator.vote(&id, voter, vote).await?)?;
        }
        DecisionCommands::Approve { id, by, note } => {
            print_json(&coordinator.approve(&id, &by, note).await?)?;
        }
        DecisionCommands::Reject { id, by, note } => {
            print_json(&coordinator.reject(&id, &by, note).await?)?;
        }
    }
    Ok(())
}

async fn handle_escalation_command(cmd: EscalationCommands, mesh: &Mesh) -> anyhow::Result<()> {
    let coordinator = coordinator(mesh)?;
    match cmd {
        EscalationCommands::List { status } => {
            let escalations = coordinator.escalations(status).await?;
            println!("Found {} escalations:", escalations.len());
            println!();
            for e in escalations {
                println!(
                    "{}  {:<9} decision {} (deadline {})",
                    e.id,
                    e.status.as_str(),
                    e.decision_id,
                    e.deadline.format("%Y-%m-%d %H:%M UTC")
                );
                println!("  → {}", e.reason);
            }
        }
        EscalationCommands::Respond {
            id,
            approve,
            reject,
            response,
            responder,
        } => {
            if approve == reject {
                bail!("Pass exactly one of --approve or --reject");
            }
            let (escalation, decision) = coordinator
                .respond_to_escalation(&id, approve, &response, &responder)
                .await?;
            println!(
                "Escalation {} {}; decision {} is now {}",
                escalation.id, escalation.status, decision.id, decision.status
            );
        }
    }
    Ok(())
}
