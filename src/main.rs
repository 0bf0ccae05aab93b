//! # Stratus CLI (`stratus`)
//!
//! ```bash
//! stratus --config ./config/stratus.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stratus init` | Create the SQLite database and run schema migrations |
//! | `stratus project add --name <n> --path <dir>` | Register a source tree |
//! | `stratus project list` | List registered projects with their latest status |
//! | `stratus project remove <project>` | Delete a project and its collection |
//! | `stratus index <project>` | Index a project and wait for the run to finish |
//! | `stratus status <project>` | Show the latest indexing status |
//! | `stratus query <project> "<question>"` | Answer a question from the project's content |
//! | `stratus questions generate <project>` | Practice questions about the project |
//! | `stratus questions list <project>` | Questions with their graded answers |
//! | `stratus questions evaluate <project> <id> "<answer>"` | Grade an answer (0-5) |
//! | `stratus questions rephrase <project> <id>` | Store a simpler wording of a question |
//!
//! `<project>` is a project name or id.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stratus::config::{self, Config};
use stratus::questions::QuestionEntry;
use stratus::service::Stratus;
use stratus::{db, logging, migrate, StratusError};
use stratus_core::questions::{Question, QuestionLevel};

/// Stratus: per-project source indexing and retrieval-augmented question
/// answering.
#[derive(Parser)]
#[command(
    name = "stratus",
    about = "Per-project source indexing and retrieval-augmented question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/stratus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage registered projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Index a project.
    ///
    /// Claims the project, walks its source tree and reconciles the vector
    /// collection with it. Fails immediately if the project is already
    /// being indexed. Ctrl-C cancels the run, which is recorded as failed.
    Index {
        /// Project name or id.
        project: String,
    },

    /// Show a project's latest indexing status.
    Status {
        /// Project name or id.
        project: String,

        /// Also list this many previous runs.
        #[arg(long, default_value_t = 0)]
        history: i64,
    },

    /// Ask a question about a project.
    Query {
        /// Project name or id.
        project: String,

        /// The question.
        text: String,

        /// Candidates fetched from the vector store.
        #[arg(long)]
        top_k: Option<usize>,

        /// Candidates kept after reranking.
        #[arg(long)]
        top_n: Option<usize>,
    },

    /// Practice questions generated from a project's indexed content.
    Questions {
        #[command(subcommand)]
        action: QuestionAction,
    },
}

#[derive(Subcommand)]
enum QuestionAction {
    /// Show unanswered questions, generating a new set when there are none.
    Generate {
        /// Project name or id.
        project: String,

        /// easy, medium, hard (or 1, 2, 3).
        #[arg(long)]
        level: Option<QuestionLevel>,

        /// Generate a new set even if unanswered questions exist.
        #[arg(long)]
        fresh: bool,
    },
    /// List questions with their graded answers.
    List {
        /// Project name or id.
        project: String,
    },
    /// Grade an answer to a question.
    Evaluate {
        /// Project name or id.
        project: String,
        /// Question id.
        question: String,
        /// Your answer (at most 500 characters).
        answer: String,
    },
    /// Store a simpler wording of a question.
    Rephrase {
        /// Project name or id.
        project: String,
        /// Question id.
        question: String,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Register a source directory as a project.
    Add {
        /// Unique project name; also the vector collection name.
        #[arg(long)]
        name: String,

        /// Root directory of the source tree.
        #[arg(long)]
        path: PathBuf,
    },
    /// List projects.
    List,
    /// Remove a project, its status history and its indexed content.
    Remove {
        /// Project name or id.
        project: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = Stratus::open(&cfg).await?;
    let outcome = match cli.command {
        Commands::Init => Ok(()),
        Commands::Project { action } => run_project(&app, action).await,
        Commands::Index { project } => run_index(&app, &project).await,
        Commands::Status { project, history } => run_status(&app, &project, history).await,
        Commands::Query {
            project,
            text,
            top_k,
            top_n,
        } => run_query(&app, &cfg, &project, &text, top_k, top_n).await,
        Commands::Questions { action } => run_questions(&app, action).await,
    };
    if let Err(err) = &outcome {
        if err
            .downcast_ref::<StratusError>()
            .is_some_and(StratusError::is_retryable)
        {
            eprintln!("hint: this request may succeed if retried later");
        }
    }
    outcome
}

async fn run_project(app: &Stratus, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Add { name, path } => {
            let project = app.create_project(&name, &path).await?;
            println!("Project added.");
            println!("  id:    {}", project.id);
            println!("  name:  {}", project.name);
            println!("  path:  {}", project.path.display());
        }
        ProjectAction::List => {
            let projects = app.list_projects().await?;
            if projects.is_empty() {
                println!("No projects.");
                return Ok(());
            }
            println!("{:<24} {:<12} {}", "NAME", "STATUS", "PATH");
            for project in projects {
                let report = app.status(&project.id).await?;
                let state = report
                    .status
                    .map(|s| s.state.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<12} {}",
                    project.name,
                    state,
                    project.path.display()
                );
            }
        }
        ProjectAction::Remove { project } => {
            let removed = app.remove_project(&project).await?;
            println!("Project `{}` removed.", removed.name);
        }
    }
    Ok(())
}

async fn run_index(app: &Stratus, project: &str) -> Result<()> {
    let job = app.start_indexing(project).await?;
    println!("Indexing started (status {}).", job.status.id);

    let cancel = job.cancel.clone();
    let mut handle = job.handle;
    let outcome = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            cancel.cancel();
            handle.await
        }
    };
    let report = outcome.context("indexing task panicked")??;

    println!("Indexing complete.");
    println!("  documents: {}", report.documents);
    println!("  skipped:   {}", report.skipped_files);
    println!("  inserted:  {}", report.inserted);
    println!("  updated:   {}", report.updated);
    println!("  deleted:   {}", report.deleted);
    println!("  unchanged: {}", report.unchanged);
    Ok(())
}

async fn run_status(app: &Stratus, project: &str, history: i64) -> Result<()> {
    let report = app.status(project).await?;
    println!("project:    {}", report.project.name);
    println!("id:         {}", report.project.id);
    println!("path:       {}", report.project.path.display());
    println!("units:      {}", report.units);
    match &report.status {
        Some(status) => {
            println!("state:      {}", status.state);
            println!("updated_at: {}", status.updated_at.to_rfc3339());
            if let Some(message) = &status.message {
                println!("message:    {}", message);
            }
        }
        None => println!("state:      -"),
    }

    if history > 0 {
        println!();
        println!("{:<38} {:<12} {}", "RUN", "STATE", "UPDATED");
        for status in app.history(project, history).await? {
            println!(
                "{:<38} {:<12} {}",
                status.id,
                status.state,
                status.updated_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

async fn run_query(
    app: &Stratus,
    cfg: &Config,
    project: &str,
    text: &str,
    top_k: Option<usize>,
    top_n: Option<usize>,
) -> Result<()> {
    let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
    if let Some(n) = top_n {
        anyhow::ensure!(
            n >= 1 && n <= top_k,
            "--top-n must be between 1 and top_k ({top_k})"
        );
    }
    let answer = app.query(project, text, Some(top_k), top_n).await?;

    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("--- Sources ({}) ---", answer.sources.len());
        for (i, node) in answer.sources.iter().enumerate() {
            let path = node
                .metadata
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or(node.identity.as_str());
            let lines = match (
                node.metadata.get("line_start").and_then(|v| v.as_u64()),
                node.metadata.get("line_end").and_then(|v| v.as_u64()),
            ) {
                (Some(start), Some(end)) => format!(":{start}-{end}"),
                _ => String::new(),
            };
            println!("{}. [{:.3}] {}{}", i + 1, node.score, path, lines);
        }
    }
    Ok(())
}

fn print_question(question: &Question) {
    println!("[{}] ({}) {}", question.id, question.level, question.question);
}

async fn run_questions(app: &Stratus, action: QuestionAction) -> Result<()> {
    match action {
        QuestionAction::Generate {
            project,
            level,
            fresh,
        } => {
            let questions = app.generate_questions(&project, level, fresh).await?;
            for question in &questions {
                print_question(question);
            }
        }
        QuestionAction::List { project } => {
            let entries = app.list_questions(&project).await?;
            if entries.is_empty() {
                println!("No questions.");
                return Ok(());
            }
            for QuestionEntry { question, answer } in &entries {
                print_question(question);
                if let Some(answer) = answer {
                    println!("    score: {:.1}/5  answer: {}", answer.score, answer.answer);
                }
            }
        }
        QuestionAction::Evaluate {
            project,
            question,
            answer,
        } => {
            let graded = app.evaluate_answer(&project, &question, &answer).await?;
            println!("score:        {:.1}/5", graded.score);
            println!("reasoning:    {}", graded.reasoning);
            println!("ideal answer: {}", graded.ideal_answer);
        }
        QuestionAction::Rephrase { project, question } => {
            let rephrased = app.rephrase_question(&project, &question).await?;
            print_question(&rephrased);
        }
    }
    Ok(())
}
