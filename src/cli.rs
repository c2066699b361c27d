//! CLI interface for capsmith

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use crate::config::Config;
use crate::db::{Database, StoreSummary};
use crate::dependencies::DependencyGraph;
use crate::detection::{run_detection, RuleSet};
use crate::error::EvolveError;
use crate::gaps::{DetectionSchedule, GapRepository};
use crate::lifecycle::{
    transfer, AutoConfirm, CapabilityRepository, Confirm, InstallRoot, LifecycleManager, LifecycleOutcome,
    StdinConfirm, ALLOWED_INSTALL_DIRS,
};
use crate::observations::ObservationLog;
use crate::proposals::ProposalRepository;
use crate::synthesis::{ProposalReview, Synthesizer, TemplateGenerator};
use crate::types::{CapabilityStatus, DependencyType, GapStatus, ProposalStatus};
use crate::usage::UsageTracker;

const DEFAULT_RULE_FILE: &str = "tool-errors.yaml";
const DEFAULT_RULE: &str = r#"id: tool-errors
version: 1
gap_type: tool
priority: high
enabled: true
triggers:
  - condition: tool_error
    confidence_boost: 0.2
min_confidence: 0.3
"#;

#[derive(Parser)]
#[command(name = "capsmith")]
#[command(about = "Detect capability gaps from agent observations and manage generated capabilities", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "CAPSMITH_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON where supported
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the instance directories, database and a starter rule
    Init,
    /// Show store counts and detection schedule
    Status,
    /// Run gap detection over unprocessed observations
    Detect {
        /// Ignore the detection interval
        #[arg(short, long)]
        force: bool,
    },
    /// Decay stale pending gaps
    Decay,
    /// List gaps
    Gaps {
        /// Filter by status (pending, proposed, resolved, dismissed)
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum gaps to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Permanently dismiss a gap
    GapDismiss {
        /// Gap id or unique prefix
        id: String,
        /// Reason recorded with the dismissal
        #[arg(short, long, default_value = "User dismissed")]
        reason: String,
    },
    /// Generate proposals for pending gaps
    Synthesize {
        /// A single gap id (defaults to the highest-confidence pending gaps)
        gap: Option<String>,
        /// Maximum gaps to synthesize
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// List proposals
    Proposals {
        /// Filter by status (pending, installed, rejected, rolled_back)
        #[arg(short, long, default_value = "pending")]
        status: String,
    },
    /// Show a proposal with file previews and content findings
    Review {
        /// Proposal id or unique prefix
        id: String,
    },
    /// Install a pending proposal
    Approve {
        /// Proposal id or unique prefix
        id: String,
        /// Do not prompt before overwriting existing files
        #[arg(short, long)]
        yes: bool,
        /// Install even when the review flagged suspicious content
        #[arg(long)]
        allow_flagged: bool,
    },
    /// Reject a pending proposal
    Reject {
        /// Proposal id or unique prefix
        id: String,
        /// Why the proposal was rejected
        #[arg(short, long)]
        reason: String,
    },
    /// Roll back an installed capability
    Rollback {
        /// Capability name, id or id prefix
        capability: String,
        /// Proceed past optional dependents
        #[arg(short, long)]
        force: bool,
        /// Do not prompt for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Write an active capability and its files to a JSON export
    Export {
        /// Capability name, id or id prefix
        capability: String,
        /// Output file (defaults to capability-<name>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Record an exported capability as a pending proposal
    Import {
        /// Export file to read
        file: PathBuf,
        /// Import even when the content scan finds suspicious patterns
        #[arg(long)]
        force: bool,
    },
    /// List installed capabilities
    Capabilities {
        /// Include rolled back and deprecated capabilities
        #[arg(short, long)]
        all: bool,
    },
    /// Manage dependencies between capabilities
    Deps {
        #[command(subcommand)]
        command: DepsCommands,
    },
    /// Show or record capability usage
    Usage {
        /// Capability name or id
        capability: Option<String>,
        /// Record one use of the capability instead of showing stats
        #[arg(long, requires = "capability")]
        record: bool,
        /// Session to attribute a recorded use to
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum DepsCommands {
    /// Declare that CAPABILITY depends on DEPENDS_ON
    Add {
        capability: String,
        depends_on: String,
        /// required, optional or suggested
        #[arg(short = 't', long = "type", default_value = "required")]
        dependency_type: String,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// Remove a dependency edge
    Remove { capability: String, depends_on: String },
    /// Show dependencies and dependents of a capability
    List { capability: String },
}

struct App {
    config: Config,
    json: bool,
}

impl App {
    fn load(config: Option<PathBuf>, json: bool) -> Result<Self> {
        let config = match config {
            Some(path) => Config::load_from(&path)?,
            None => Config::load()?,
        };
        Ok(Self { config, json })
    }

    fn open_db(&self) -> Result<Database> {
        let path = self.config.database_path()?;
        Database::open(&path, self.config.lock_timeout())
            .with_context(|| format!("Failed to open database {}", path.display()))
    }

    fn install_root(&self) -> Result<InstallRoot> {
        Ok(InstallRoot::new(&self.config.instance_root()?)?)
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print an outcome; an unsuccessful one becomes the command's error
    fn finish(&self, outcome: LifecycleOutcome) -> Result<()> {
        if self.json {
            self.print_json(&outcome)?;
        } else {
            println!("{}", outcome.message);
            for file in &outcome.files_affected {
                println!("  {}", file);
            }
            for warning in &outcome.warnings {
                println!("  warning: {}", warning);
            }
            if !outcome.success && !outcome.dependents.is_empty() {
                println!("  dependents: {}", outcome.dependents.join(", "));
            }
        }

        match outcome.failure {
            Some(kind) if !outcome.success => anyhow::bail!("{} ({})", outcome.message, kind),
            _ => Ok(()),
        }
    }
}

fn parse_status<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(value).with_context(|| format!("Unknown {} status: {}", what, value))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let result = dispatch(cli);

    if let Err(e) = &result {
        if e.downcast_ref::<EvolveError>().map(|e| e.is_lock_timeout()).unwrap_or(false) {
            error!("Datastore is locked by another capsmith process; giving up after the lock wait");
        }
    }
    result
}

fn dispatch(cli: Cli) -> Result<()> {
    let app = App::load(cli.config, cli.json)?;

    match cli.command {
        Commands::Init => init(&app)?,
        Commands::Status => status(&app)?,
        Commands::Detect { force } => detect(&app, force)?,
        Commands::Decay => {
            let db = app.open_db()?;
            let decayed = GapRepository::new(&db).decay(Utc::now())?;
            println!("Decayed {} stale gap(s)", decayed);
        }
        Commands::Gaps { status, limit } => {
            let db = app.open_db()?;
            let status = status
                .as_deref()
                .map(|s| parse_status(s, GapStatus::parse, "gap"))
                .transpose()?;
            let gaps = GapRepository::new(&db).list(status, limit)?;
            if app.json {
                return app.print_json(&gaps);
            }
            if gaps.is_empty() {
                println!("No gaps found.");
                return Ok(());
            }
            println!("{:<18} {:<14} {:<10} {:>5} {:<8} {:<10} CAPABILITY", "ID", "TYPE", "DOMAIN", "CONF", "SCOPE", "STATUS");
            for g in &gaps {
                println!(
                    "{:<18} {:<14} {:<10} {:>5.2} {:<8} {:<10} {}",
                    g.id,
                    g.gap_type,
                    g.domain.as_deref().unwrap_or("-"),
                    g.confidence,
                    g.recommended_scope,
                    g.status,
                    crate::types::truncate_chars(&g.desired_capability, 40)
                );
            }
        }
        Commands::GapDismiss { id, reason } => {
            let db = app.open_db()?;
            let gap = GapRepository::new(&db).dismiss(&id, &reason)?;
            println!("Gap dismissed: {}", gap.id);
        }
        Commands::Synthesize { gap, limit } => {
            let db = app.open_db()?;
            let generator = TemplateGenerator::new();
            let synthesizer = Synthesizer::new(&db, &generator);
            let proposals = match gap {
                Some(id) => vec![synthesizer.synthesize(&id)?],
                None => synthesizer.synthesize_pending(limit)?,
            };
            if proposals.is_empty() {
                println!("No pending gaps to synthesize.");
            }
            for p in &proposals {
                println!(
                    "  - [{}] {} (conf: {:.2}) {}",
                    p.capability_type, p.capability_name, p.confidence, p.id
                );
            }
        }
        Commands::Proposals { status } => {
            let db = app.open_db()?;
            let status = parse_status(&status, ProposalStatus::parse, "proposal")?;
            let proposals = ProposalRepository::new(&db).list(Some(status))?;
            if app.json {
                return app.print_json(&proposals);
            }
            if proposals.is_empty() {
                println!("No {} proposals.", status);
            }
            for (i, p) in proposals.iter().enumerate() {
                println!("{}. [{}] {} ({})", i + 1, p.capability_type.to_uppercase(), p.capability_name, p.id);
                println!("   Confidence: {:.2} | Scope: {}", p.confidence, p.scope);
            }
        }
        Commands::Review { id } => {
            let db = app.open_db()?;
            print!("{}", ProposalReview::load(&db, &id)?.render());
        }
        Commands::Approve { id, yes, allow_flagged } => {
            let db = app.open_db()?;
            let review = ProposalReview::load(&db, &id)?;
            if review.is_flagged() && !allow_flagged {
                for finding in &review.findings {
                    println!("  - {}", finding);
                }
                anyhow::bail!(
                    "Proposal {} was flagged during review; pass --allow-flagged to install anyway",
                    review.proposal.id
                );
            }
            let confirm = confirmer(yes);
            let manager = LifecycleManager::new(&db, app.install_root()?, confirm.as_ref());
            app.finish(manager.install(&review.proposal.id)?)?;
        }
        Commands::Reject { id, reason } => {
            let db = app.open_db()?;
            let confirm = AutoConfirm(true);
            let manager = LifecycleManager::new(&db, app.install_root()?, &confirm);
            app.finish(manager.reject(&id, &reason)?)?;
        }
        Commands::Rollback { capability, force, yes } => {
            let db = app.open_db()?;
            let confirm = confirmer(yes);
            let manager = LifecycleManager::new(&db, app.install_root()?, confirm.as_ref());
            app.finish(manager.rollback(&capability, force)?)?;
        }
        Commands::Export { capability, output } => {
            let db = app.open_db()?;
            let path = transfer::export_to_file(&db, &app.install_root()?, &capability, output.as_deref())?;
            println!("Exported to: {}", path.display());
        }
        Commands::Import { file, force } => {
            let db = app.open_db()?;
            let outcome = transfer::import_from_file(&db, &app.install_root()?, &file, force)?;
            if app.json {
                return app.print_json(&outcome);
            }
            for warning in &outcome.warnings {
                println!("  warning: {}", warning);
            }
            println!(
                "Imported {} as proposal {}",
                outcome.proposal.capability_name, outcome.proposal.id
            );
            println!(
                "  review with `capsmith review {0}`, install with `capsmith approve {0}`",
                outcome.proposal.id
            );
        }
        Commands::Capabilities { all } => {
            let db = app.open_db()?;
            let filter = if all { None } else { Some(CapabilityStatus::Active) };
            let capabilities = CapabilityRepository::new(&db).list(filter)?;
            if app.json {
                return app.print_json(&capabilities);
            }
            if capabilities.is_empty() {
                println!("No installed capabilities.");
                return Ok(());
            }
            let stats = UsageTracker::new(&db).usage_stats(None)?;
            println!("{:<28} {:<8} {:<8} {:<12} {:<11} USED", "NAME", "TYPE", "SCOPE", "STATUS", "INSTALLED");
            for c in &capabilities {
                let used = stats
                    .iter()
                    .find(|s| s.capability_id == c.id)
                    .map(|s| s.usage_count)
                    .unwrap_or(0);
                println!(
                    "{:<28} {:<8} {:<8} {:<12} {:<11} {}",
                    c.name,
                    c.capability_type,
                    c.scope,
                    c.status,
                    c.installed_at.format("%Y-%m-%d"),
                    used
                );
            }
        }
        Commands::Deps { command } => deps(&app, command)?,
        Commands::Usage { capability, record, session } => {
            let db = app.open_db()?;
            let tracker = UsageTracker::new(&db);
            if record {
                let name = capability.as_deref().unwrap_or_default();
                let id = tracker.record_usage(name, session.as_deref(), Some("manual"))?;
                println!("Recorded usage of {}", id);
                return Ok(());
            }
            let stats = tracker.usage_stats(capability.as_deref())?;
            if app.json {
                return app.print_json(&stats);
            }
            for s in &stats {
                println!(
                    "{:<28} {:<8} {:>5} uses  last: {}",
                    s.name,
                    s.capability_type,
                    s.usage_count,
                    s.last_used.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn confirmer(yes: bool) -> Box<dyn Confirm> {
    if yes {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(StdinConfirm)
    }
}

fn init(app: &App) -> Result<()> {
    let root = app.install_root()?;
    for dir in ALLOWED_INSTALL_DIRS {
        let path = root.path().join(dir);
        std::fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    }

    let rules_dir = app.config.rules_dir()?;
    std::fs::create_dir_all(&rules_dir).with_context(|| format!("Failed to create {}", rules_dir.display()))?;
    let starter = rules_dir.join(DEFAULT_RULE_FILE);
    if !starter.exists() {
        std::fs::write(&starter, DEFAULT_RULE).with_context(|| format!("Failed to write {}", starter.display()))?;
    }

    app.open_db()?;
    println!("Initialized capsmith at {}", root.path().display());
    println!("  database: {}", app.config.database_path()?.display());
    println!("  rules:    {}", rules_dir.display());
    Ok(())
}

fn status(app: &App) -> Result<()> {
    let db = app.open_db()?;
    let summary = db.summary()?;
    if app.json {
        return app.print_json(&summary);
    }

    let print_counts = |label: &str, counts: &[(String, u64)]| {
        println!("  {}: {}", label, StoreSummary::total(counts));
        for (status, n) in counts {
            println!("    {}: {}", status, n);
        }
    };

    println!("CAPSMITH STATUS");
    println!("{}", "=".repeat(40));
    println!("  Processed observations: {}", summary.processed_observations);
    print_counts("Gaps", &summary.gaps);
    print_counts("Proposals", &summary.proposals);
    print_counts("Capabilities", &summary.capabilities);
    println!("  Dependencies: {}", summary.dependencies);
    println!("  Usage events: {}", summary.usage_events);
    println!("  Last detection: {}", summary.last_detection.as_deref().unwrap_or("never"));
    println!(
        "  Last attempt:   {}",
        summary.last_detection_attempt.as_deref().unwrap_or("never")
    );
    Ok(())
}

fn detect(app: &App, force: bool) -> Result<()> {
    let db = app.open_db()?;
    let schedule = DetectionSchedule::new(&db, app.config.detection.periodic_minutes);
    let limit = app.config.detection.batch_limit;

    let outcome = schedule.run_periodic(Utc::now(), force, || {
        let rules = RuleSet::load_dir(&app.config.rules_dir()?)?;
        let observations = ObservationLog::new(app.config.observations_path()?).read_unprocessed(usize::MAX)?;
        Ok(run_detection(&db, &rules, &observations, limit)?)
    })?;

    if app.json {
        return app.print_json(&outcome);
    }
    if !outcome.ran {
        println!("{}", outcome.reason.as_deref().unwrap_or("Detection skipped"));
        return Ok(());
    }
    if let Some(err) = &outcome.error {
        anyhow::bail!("Detection failed: {}", err);
    }
    if let Some(report) = &outcome.report {
        println!(
            "Considered {} observation(s): {} new gap(s), {} merged, {} decayed",
            report.observations_considered,
            report.new_gap_ids.len(),
            report.merged,
            outcome.decayed
        );
        for id in &report.new_gap_ids {
            println!("  + {}", id);
        }
    }
    Ok(())
}

fn deps(app: &App, command: DepsCommands) -> Result<()> {
    let db = app.open_db()?;
    let graph = DependencyGraph::new(&db);

    match command {
        DepsCommands::Add { capability, depends_on, dependency_type, notes } => {
            let kind = DependencyType::parse(&dependency_type)
                .with_context(|| format!("Unknown dependency type: {}", dependency_type))?;
            let edge = graph.add(&capability, &depends_on, kind, notes.as_deref())?;
            println!(
                "{} now {} {}",
                edge.capability_name,
                match edge.dependency_type {
                    DependencyType::Required => "requires",
                    DependencyType::Optional => "optionally uses",
                    DependencyType::Suggested => "suggests",
                },
                edge.depends_on_name
            );
        }
        DepsCommands::Remove { capability, depends_on } => {
            if graph.remove(&capability, &depends_on)? {
                println!("Removed dependency {} -> {}", capability, depends_on);
            } else {
                println!("No dependency {} -> {}", capability, depends_on);
            }
        }
        DepsCommands::List { capability } => {
            let dependencies = graph.dependencies(&capability)?;
            let dependents = graph.dependents(&capability)?;
            if app.json {
                return app.print_json(&serde_json::json!({
                    "dependencies": dependencies,
                    "dependents": dependents,
                }));
            }
            println!("Depends on:");
            for e in &dependencies {
                println!("  {} ({})", e.depends_on_name, e.dependency_type);
            }
            println!("Depended on by:");
            for e in &dependents {
                println!("  {} ({})", e.capability_name, e.dependency_type);
            }
        }
    }
    Ok(())
}
