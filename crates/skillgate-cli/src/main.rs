//! skillgate - operator CLI for the skill execution substrate
//!
//! ## Commands
//!
//! - `list`: Show the skills in the current snapshot
//! - `validate`: Load manifest roots and report excluded manifests
//! - `hash`: Print a skill's security hash
//! - `grant` / `revoke`: Manage per-agent grants
//! - `approve-write`: Record a single-use write checkpoint
//! - `receipts`: Show the provenance log for an agent and skill
//! - `invoke`: Run one invocation and print the result envelope

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use skillgate_core::{
    DockerCli, InvocationRequest, InvocationResponse, ManifestSummary, Orchestrator,
    SkillgateConfig,
};
use skillgate_state::{GrantMode, ProvenanceReceipt, SurrealGovernanceStore};
use tracing::{info, Level};

/// Config file picked up from the working directory when `--config` is not
/// given.
const DEFAULT_CONFIG_FILE: &str = "skillgate.toml";

#[derive(Parser)]
#[command(name = "skillgate")]
#[command(author = "Stevedores Org")]
#[command(version = skillgate_core::VERSION)]
#[command(about = "Capability-gated, sandboxed skill execution", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "SKILLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List skills in the current snapshot
    List,

    /// Load every manifest root and report excluded manifests
    Validate,

    /// Print the security hash of a loaded skill
    Hash {
        /// Skill id
        skill: String,
    },

    /// Grant an agent access to the current version of a skill
    Grant {
        /// Agent id
        agent: String,

        /// Skill id
        skill: String,

        /// Grant mode: run-once or always-allow
        #[arg(short, long, default_value = "run-once")]
        mode: GrantMode,

        /// Operator recording the grant
        #[arg(long)]
        by: Option<String>,
    },

    /// Remove every grant and pending checkpoint for an agent and skill
    Revoke {
        /// Agent id
        agent: String,

        /// Skill id
        skill: String,
    },

    /// Approve one side-effecting invocation
    ApproveWrite {
        /// Agent id
        agent: String,

        /// Skill id
        skill: String,

        /// Approver identity
        #[arg(long)]
        by: String,

        /// Seconds until the approval lapses
        #[arg(long)]
        ttl_secs: Option<u64>,

        /// Free-form note stored with the checkpoint
        #[arg(long)]
        note: Option<String>,
    },

    /// Show provenance receipts for an agent and skill
    Receipts {
        /// Agent id
        agent: String,

        /// Skill id
        skill: String,

        /// Show only the most recent N receipts
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Invoke a skill and print the result envelope
    Invoke {
        /// Agent id
        agent: String,

        /// Skill id
        skill: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Session context as a JSON object
        #[arg(long, default_value = "{}")]
        session: String,

        /// Caller deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    skillgate_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let store = SurrealGovernanceStore::connect(&config.store)
        .await
        .context("Failed to connect to the governance store")?;
    let containers = DockerCli::new(config.sandbox.docker_binary.clone());
    let orch = Orchestrator::from_config(&config, Arc::new(store), Arc::new(containers))
        .context("Invalid configuration")?;

    let diagnostics = orch.reload();
    info!(
        skills = orch.snapshot().len(),
        excluded = diagnostics.len(),
        "snapshot ready"
    );

    match cli.command {
        Commands::List => cmd_list(&orch, cli.output),
        Commands::Validate => cmd_validate(&orch, cli.output),
        Commands::Hash { skill } => cmd_hash(&orch, &skill),
        Commands::Grant {
            agent,
            skill,
            mode,
            by,
        } => cmd_grant(&orch, &agent, &skill, mode, by.as_deref()).await,
        Commands::Revoke { agent, skill } => cmd_revoke(&orch, &agent, &skill).await,
        Commands::ApproveWrite {
            agent,
            skill,
            by,
            ttl_secs,
            note,
        } => cmd_approve_write(&orch, &agent, &skill, &by, ttl_secs, note.as_deref()).await,
        Commands::Receipts {
            agent,
            skill,
            limit,
        } => cmd_receipts(&orch, &agent, &skill, limit, cli.output).await,
        Commands::Invoke {
            agent,
            skill,
            args,
            session,
            deadline_ms,
        } => {
            let request = build_request(&agent, &skill, &args, &session, deadline_ms)?;
            let response = orch.invoke(request).await;
            println!("{}", render_response(&response, cli.output)?);
            if !response.is_ok() {
                std::process::exit(2);
            }
            Ok(())
        }
    }
}

/// Explicit path first, then `./skillgate.toml`, then built-in defaults.
/// Environment overrides apply in every case.
fn load_config(path: Option<&Path>) -> Result<SkillgateConfig> {
    match path {
        Some(p) => SkillgateConfig::load(p)
            .with_context(|| format!("Failed to load config from {}", p.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            SkillgateConfig::load(DEFAULT_CONFIG_FILE)
                .with_context(|| format!("Failed to load {DEFAULT_CONFIG_FILE}"))
        }
        None => SkillgateConfig::default()
            .apply_env()
            .validated()
            .context("Invalid configuration from environment"),
    }
}

fn cmd_list(orch: &Orchestrator, output: OutputFormat) -> Result<()> {
    println!("{}", render_summaries(&orch.list_snapshot(), output)?);
    Ok(())
}

fn cmd_validate(orch: &Orchestrator, output: OutputFormat) -> Result<()> {
    // Diagnostics are per load, so run a fresh one for the report.
    let diagnostics = orch.reload();
    let loaded = orch.snapshot().len();
    match output {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "loaded": loaded,
                "excluded": diagnostics
                    .iter()
                    .map(|d| serde_json::json!({
                        "path": d.path.display().to_string(),
                        "skill_id": d.skill_id,
                        "error": d.error.to_string(),
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("{loaded} skill(s) loaded, {} excluded", diagnostics.len());
            for d in &diagnostics {
                println!("  - {d}");
            }
        }
    }
    if !diagnostics.is_empty() {
        bail!("{} manifest(s) failed validation", diagnostics.len());
    }
    Ok(())
}

fn cmd_hash(orch: &Orchestrator, skill: &str) -> Result<()> {
    let hash = orch
        .security_hash(skill)
        .with_context(|| format!("Skill '{skill}' is not in the current snapshot"))?;
    println!("{hash}");
    Ok(())
}

async fn cmd_grant(
    orch: &Orchestrator,
    agent: &str,
    skill: &str,
    mode: GrantMode,
    by: Option<&str>,
) -> Result<()> {
    let grant = orch
        .grant(agent, skill, mode, by)
        .await
        .context("Failed to record grant")?;
    println!(
        "Granted {} {} on {} ({})",
        grant.agent_id,
        grant.mode,
        grant.skill_id,
        grant.security_hash.short()
    );
    Ok(())
}

async fn cmd_revoke(orch: &Orchestrator, agent: &str, skill: &str) -> Result<()> {
    let removed = orch
        .revoke(agent, skill)
        .await
        .context("Failed to revoke")?;
    println!("Revoked {removed} record(s) for {agent} on {skill}");
    Ok(())
}

async fn cmd_approve_write(
    orch: &Orchestrator,
    agent: &str,
    skill: &str,
    by: &str,
    ttl_secs: Option<u64>,
    note: Option<&str>,
) -> Result<()> {
    let checkpoint = orch
        .approve_write(agent, skill, by, ttl_secs, note)
        .await
        .context("Failed to record write approval")?;
    println!("Checkpoint {}", checkpoint.checkpoint_id);
    if let Some(expires) = checkpoint.expires_at {
        println!("Expires:   {}", expires.to_rfc3339());
    }
    Ok(())
}

async fn cmd_receipts(
    orch: &Orchestrator,
    agent: &str,
    skill: &str,
    limit: Option<usize>,
    output: OutputFormat,
) -> Result<()> {
    let mut receipts = orch
        .receipts(agent, skill)
        .await
        .context("Failed to read receipts")?;
    if let Some(n) = limit {
        let skip = receipts.len().saturating_sub(n);
        receipts.drain(..skip);
    }
    println!("{}", render_receipts(&receipts, output)?);
    Ok(())
}

fn build_request(
    agent: &str,
    skill: &str,
    args: &str,
    session: &str,
    deadline_ms: Option<u64>,
) -> Result<InvocationRequest> {
    let tool_args: Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    let session: Value = serde_json::from_str(session).context("--session is not valid JSON")?;
    let mut request = InvocationRequest::new(agent, skill, tool_args).with_session(session);
    if let Some(ms) = deadline_ms {
        request = request.with_deadline(Duration::from_millis(ms));
    }
    Ok(request)
}

fn render_summaries(summaries: &[ManifestSummary], output: OutputFormat) -> Result<String> {
    if output == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(summaries)?);
    }
    if summaries.is_empty() {
        return Ok("No skills loaded.".to_string());
    }
    let lines: Vec<String> = summaries
        .iter()
        .map(|s| {
            let mut flags = Vec::new();
            if s.write_access {
                flags.push("write");
            }
            if s.network {
                flags.push("network");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(","))
            };
            format!(
                "{:<32} {:<10} {}{}",
                s.id,
                s.version,
                s.invocation_mode.as_str(),
                flags
            )
        })
        .collect();
    Ok(lines.join("\n"))
}

fn render_receipts(receipts: &[ProvenanceReceipt], output: OutputFormat) -> Result<String> {
    if output == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(receipts)?);
    }
    if receipts.is_empty() {
        return Ok("No receipts.".to_string());
    }
    let lines: Vec<String> = receipts
        .iter()
        .map(|r| {
            format!(
                "#{:<4} {} {:<9} {:<22} {:>6}ms {}",
                r.seq,
                r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                r.outcome,
                r.error_code.as_deref().unwrap_or("-"),
                r.duration_ms,
                r.invocation_id
            )
        })
        .collect();
    Ok(lines.join("\n"))
}

fn render_response(response: &InvocationResponse, output: OutputFormat) -> Result<String> {
    match output {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(response)?),
        OutputFormat::Text => {
            let mut out = format!("{} {}", response.invocation_id, response.status);
            if let Some(code) = response.error_code {
                out.push_str(&format!(" {code}"));
            }
            if let Some(message) = &response.message {
                out.push_str(&format!(": {message}"));
            }
            if let Some(data) = &response.data {
                out.push('\n');
                out.push_str(&serde_json::to_string_pretty(data)?);
            }
            Ok(out)
        }
    }
}
