//! # Embedder CLI
//!
//! The `embedder` binary drives the RAG backend: corpus embedding,
//! incremental updates, semantic search, interactive chat, and the HTTP
//! server with its background watcher.
//!
//! ## Usage
//!
//! ```bash
//! embedder --config ./settings.json <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `embedder embed` | Process and embed all configured sources |
//! | `embedder update` | Incrementally update changed files only |
//! | `embedder watch` | Continuously monitor and update |
//! | `embedder search "<query>"` | Search for similar chunks |
//! | `embedder stats` | Show corpus statistics |
//! | `embedder clear` | Clear all data |
//! | `embedder compact` | Reclaim deleted vector space |
//! | `embedder chat` | Interactive retrieval-augmented chat |
//! | `embedder serve` | Start the HTTP API server |
//! | `embedder providers` | List (or test) completion providers |
//! | `embedder reset-password` | Reset the admin password |
//!
//! Exit code 0 on success, 1 on runtime errors; argument errors use clap's
//! own exit code.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use embedder::auth::AdminAuth;
use embedder::completion::CompletionClient;
use embedder::config::{self, Settings};
use embedder::embedding::{self, EmbeddingClient, EncodeKind};
use embedder::index::DistanceMetric;
use embedder::ingest::IngestEngine;
use embedder::serve::run_serve;
use embedder::store::VectorStore;
use embedder::tokenizer::Tokenizer;

/// Embedder — a self-hosted RAG backend for source-code corpora.
#[derive(Parser)]
#[command(
    name = "embedder",
    about = "Embedder RAG system — ingest, search, and chat over your own sources",
    version,
    disable_version_flag = true
)]
struct Cli {
    /// Path to the JSON settings file.
    #[arg(
        short = 'c',
        long,
        global = true,
        default_value = "settings.json",
        env = "EMBEDDER_CONFIG"
    )]
    config: PathBuf,

    /// Skip the startup provider test calls.
    #[arg(long, global = true)]
    no_startup_tests: bool,

    /// Print version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process and embed all configured sources.
    Embed {
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Incrementally update changed files only.
    Update,

    /// Continuously monitor and update.
    Watch {
        /// Update interval in seconds.
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Search for similar chunks.
    Search {
        /// The search query.
        query: String,
        /// Number of results.
        #[arg(long, default_value_t = 5)]
        top: usize,
    },

    /// Show corpus statistics.
    Stats,

    /// Clear all data.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Reclaim deleted vector space.
    Compact,

    /// Interactive retrieval-augmented chat.
    Chat,

    /// Start the HTTP API server.
    Serve {
        /// Server port; increments automatically when taken.
        #[arg(short = 'p', long, default_value_t = 8590, env = "EMBEDDER_PORT")]
        port: u16,
        /// Enable the background auto-update watcher.
        #[arg(long)]
        watch: bool,
        /// Watch interval in seconds.
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Caller-provided key for privileged operations (e.g. shutdown
        /// requests through the instance registry).
        #[arg(long, default_value = "")]
        appkey: String,
        /// Path to store instance info such as the bound port.
        #[arg(long)]
        info_file: Option<PathBuf>,
        /// Skip the default-password warning prompt.
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// List embedding and completion providers.
    Providers {
        /// Run a test call against the given provider id.
        #[arg(long)]
        test: Option<String>,
    },

    /// Reset the admin password.
    ResetPassword {
        /// The new password (min 8 chars, not "admin").
        #[arg(long)]
        pass: String,
    },

    /// Reset the admin password interactively.
    ResetPasswordInteractive,

    /// Check the admin password status.
    PasswordStatus,

    /// Validate an admin password.
    ValidatePassword {
        /// Password to check.
        #[arg(long)]
        pass: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        eprintln!("Run with --help for usage information");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = config::find_config_file(&cli.config)?;
    let mut settings = Settings::load(&config_path)
        .with_context(|| format!("Unable to read settings file {}", config_path.display()))?;
    init_logging(&settings.logging);
    info!(path = %config_path.display(), "Read settings");
    settings.hydrate_project_identity()?;

    // Password commands need no engine.
    match &cli.command {
        Commands::ValidatePassword { pass } => {
            let auth = AdminAuth::new();
            if auth.verify_password(pass) {
                println!("Password is valid");
            } else {
                println!("Invalid password");
            }
            return Ok(());
        }
        Commands::ResetPassword { pass } => {
            let auth = AdminAuth::new();
            auth.set_password(pass)?;
            println!("Admin password has been reset");
            return Ok(());
        }
        Commands::ResetPasswordInteractive => {
            return reset_password_interactive();
        }
        Commands::PasswordStatus => {
            let auth = AdminAuth::new();
            println!("Admin Password Status:");
            println!("-------------------------");
            if auth.is_default_password() {
                println!("Status: Using default password 'admin'");
                println!("  WARNING: Please change the default password!");
                println!("Run: embedder reset-password --pass <your_password>");
            } else {
                println!("Status: Custom password set");
                println!("Last modified: {}", auth.file_last_modified());
            }
            return Ok(());
        }
        _ => {}
    }

    let tokenizer = Arc::new(Tokenizer::new(Path::new(&settings.tokenizer.config_path)));
    let metric = DistanceMetric::parse(&settings.database.distance_metric)?;
    let store = Arc::new(
        VectorStore::open(
            &settings.database.sqlite_path,
            &settings.database.index_path,
            settings.database.vector_dim,
            settings.database.max_elements,
            metric,
        )
        .await?,
    );
    let engine = Arc::new(IngestEngine::new(
        Arc::clone(&store),
        Arc::clone(&tokenizer),
        settings.clone(),
    ));
    let auth = Arc::new(AdminAuth::new());

    if !cli.no_startup_tests && !run_startup_tests(&settings, &tokenizer).await {
        bail!("Wrong/incomplete settings. Exiting.");
    }

    match cli.command {
        Commands::Embed { force } => {
            engine.embed(force).await?;
        }
        Commands::Update => {
            engine.update().await?;
        }
        Commands::Watch { interval } => {
            println!("Starting watch mode (checking every {} seconds)", interval);
            println!("Press Ctrl+C to stop");
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval.max(1))).await;
                if let Err(e) = engine.update().await {
                    tracing::warn!(error = %e, "Error during update");
                }
            }
        }
        Commands::Search { query, top } => {
            run_search(&settings, &store, &query, top).await?;
        }
        Commands::Stats => {
            println!("\n=== Database Statistics ===");
            let stats = engine.source_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Clear { yes } => {
            if yes || confirm("Are you sure you want to clear all data? [y/N]: ") {
                store.clear().await?;
                println!("Database cleared.");
            } else {
                println!("Cancelled.");
            }
        }
        Commands::Compact => {
            engine.compact().await?;
        }
        Commands::Chat => {
            run_chat(&settings, &store, &tokenizer).await?;
        }
        Commands::Providers { test } => {
            run_providers(&settings, &tokenizer, test.as_deref()).await?;
        }
        Commands::Serve {
            port,
            watch,
            interval,
            appkey,
            info_file,
            yes,
        } => {
            if !yes && auth.is_default_password() {
                println!("\n  WARNING: You are using the default admin password!");
                println!("This is a security risk. Please change it:");
                println!("  embedder reset-password --pass <new_password>\n");
                if !confirm("Continue anyway? [y/N]: ") {
                    bail!("Server start cancelled. Please reset password first.");
                }
            }
            run_serve(engine, auth, appkey, port, watch, interval, info_file).await?;
        }
        // Handled above.
        Commands::ValidatePassword { .. }
        | Commands::ResetPassword { .. }
        | Commands::ResetPasswordInteractive
        | Commands::PasswordStatus => unreachable!(),
    }

    Ok(())
}

fn init_logging(cfg: &embedder::config::LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = cfg.log_to_console.then(|| fmt::layer().compact());
    let file_layer = cfg
        .log_to_file
        .then(|| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&cfg.logging_file)
                .ok()
        })
        .flatten()
        .map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

/// Smoke-test the configured providers before running a command: one query
/// embedding (with an L2-norm report and a small similarity grid) and a
/// one-word completion.
async fn run_startup_tests(settings: &Settings, tokenizer: &Tokenizer) -> bool {
    let result: Result<()> = async {
        let api = settings.embedding_current_api()?;
        info!(model = %api.model, "Testing embedding client");
        info!("  document format - '{}'", api.document_format);
        info!("  query format - '{}'", api.query_format);
        let client = EmbeddingClient::new(api, settings.embedding.timeout_ms);

        let text_a0 = "int main() {}";
        let text_a1 = "int main() { return 0; }";
        let text_b0 = "double main() { return 0.0; }";
        let text_b1 = "float main() { reutrn 0.f; }";
        let text_c0 = "class Foo { void bar() { std::cout << \"hello\"; } };";

        let v_a0 = client.generate_one(text_a0, EncodeKind::Query).await?;
        if v_a0.is_empty() {
            bail!("Embedding client not working");
        }
        info!("  Embedding client works fine. [ l2norm {} ]", embedding::l2_norm(&v_a0));
        info!("  Testing similarities:");

        let v_a1 = client.generate_one(text_a1, EncodeKind::Query).await?;
        let v_b0 = client.generate_one(text_b0, EncodeKind::Query).await?;
        let v_b1 = client.generate_one(text_b1, EncodeKind::Query).await?;
        let v_c0 = client.generate_one(text_c0, EncodeKind::Query).await?;
        let v_a0_doc = client.generate_one(text_a0, EncodeKind::Document).await?;

        info!("    A0-A1 (similar):     {}", embedding::dot(&v_a0, &v_a1));
        info!("    A0-B0 (different):   {}", embedding::dot(&v_a0, &v_b0));
        info!("    A0-B1 (typo):        {}", embedding::dot(&v_a0, &v_b1));
        info!("    B0-B1 (similar):     {}", embedding::dot(&v_b0, &v_b1));
        info!("    A0-C0 (different):   {}", embedding::dot(&v_a0, &v_c0));
        info!("    Doc-Query (similar): {}", embedding::dot(&v_a0_doc, &v_a0));

        let api = settings.generation_current_api()?;
        info!(model = %api.model, "Testing completion client");
        let client = CompletionClient::new(
            api,
            settings.generation.timeout_ms,
            tokenizer,
            settings.generation.prepend_label_format.clone(),
        );
        let messages = vec![
            serde_json::json!({"role": "system", "content": "You are a helpful assistant."}),
            serde_json::json!({"role": "user", "content": "Answer in one word only - what is the capital of France?"}),
        ];
        let answer = client
            .chat(&messages, &[], 0.0, settings.generation.default_max_tokens, None)
            .await?;
        if !answer.contains("Paris") {
            bail!("Completion client not working");
        }
        info!("  Completion client works fine.");
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        tracing::error!("  Please, check settings file and edit it manually if needed.");
        tracing::error!(
            "   [ settings file path {} ]",
            settings.config_path.display()
        );
        return false;
    }
    true
}

async fn run_search(
    settings: &Settings,
    store: &VectorStore,
    query: &str,
    top_k: usize,
) -> Result<()> {
    println!("Searching for: {}", query);
    let api = settings.embedding_current_api()?;
    let client = EmbeddingClient::new(api, settings.embedding.timeout_ms);
    let vector = client.generate_one(query, EncodeKind::Query).await?;
    let results = store.search(&vector, top_k).await?;

    println!("\nFound {} results:", results.len());
    println!("{}", "-".repeat(80));
    for (i, result) in results.iter().enumerate() {
        println!("\n[{}] Score: {}", i + 1, result.similarity_score);
        println!("Source: {}", result.source_id);
        println!("Type: {}", result.chunk_type);
        let preview: String = result.content.chars().take(200).collect();
        let ellipsis = if result.content.chars().count() > 200 {
            "..."
        } else {
            ""
        };
        println!("Content: {}{}", preview, ellipsis);
    }
    Ok(())
}

async fn run_chat(
    settings: &Settings,
    store: &VectorStore,
    tokenizer: &Tokenizer,
) -> Result<()> {
    let api = settings.generation_current_api()?;
    println!("Using model: {} at {}", api.model, api.api_url);
    println!("Entering chat mode. Type 'exit' to quit.");

    let embedding_client =
        EmbeddingClient::new(settings.embedding_current_api()?, settings.embedding.timeout_ms);
    let completion_client = CompletionClient::new(
        api,
        settings.generation.timeout_ms,
        tokenizer,
        settings.generation.prepend_label_format.clone(),
    );

    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": "You are a helpful assistant.",
    })];

    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "exit" {
            break;
        }
        messages.push(serde_json::json!({"role": "user", "content": input}));

        let turn: Result<String> = async {
            let query = embedding_client.generate_one(input, EncodeKind::Query).await?;
            let results = store.search(&query, 5).await?;
            print!("\nAssistant: ");
            std::io::stdout().flush()?;
            let mut on_stream = |chunk: &str| {
                if !chunk.starts_with("[meta]") {
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                }
            };
            completion_client
                .chat(
                    &messages,
                    &results,
                    0.0,
                    settings.generation.default_max_tokens,
                    Some(&mut on_stream),
                )
                .await
        }
        .await;

        match turn {
            Ok(response) => {
                println!();
                messages.push(serde_json::json!({"role": "assistant", "content": response}));
            }
            Err(e) => println!("Error: {}", e),
        }
    }
    println!("Exiting chat mode.");
    Ok(())
}

async fn run_providers(
    settings: &Settings,
    tokenizer: &Tokenizer,
    test: Option<&str>,
) -> Result<()> {
    let apis = &settings.generation.apis;
    match test {
        None => {
            let id_width = apis.iter().map(|a| a.id.len()).max().unwrap_or(2) + 4;
            let url_width = apis.iter().map(|a| a.api_url.len()).max().unwrap_or(3) + 4;
            println!(
                "{:<id_width$}{:<url_width$}{:<16}",
                "Id", "Url", "Enabled"
            );
            let current = settings.generation_current_api()?;
            for api in apis {
                let marker = if api.id == current.id { " current" } else { "" };
                println!(
                    "{:<id_width$}{:<url_width$}{:<16}",
                    api.id,
                    api.api_url,
                    format!("{}{}", api.enabled as u8, marker),
                );
            }
        }
        Some(id) => {
            let Some(api) = apis.iter().find(|a| a.id == id).cloned() else {
                bail!("Unable to find a provider by id = {}", id);
            };
            info!(url = %api.api_url, "Testing completion client");
            let client = CompletionClient::new(
                api,
                settings.generation.timeout_ms,
                tokenizer,
                settings.generation.prepend_label_format.clone(),
            );
            let messages = vec![
                serde_json::json!({"role": "system", "content": "You are a helpful assistant."}),
                serde_json::json!({"role": "user", "content": "What is the capital of France?"}),
            ];
            let answer = client
                .chat(&messages, &[], 0.0, settings.generation.default_max_tokens, None)
                .await?;
            println!("Question: What is the capital of France?");
            println!("Answer: {}", answer);
        }
    }
    Ok(())
}

fn reset_password_interactive() -> Result<()> {
    println!("===================================");
    println!("   Reset Admin Password");
    println!("===================================\n");

    let auth = AdminAuth::new();
    for _ in 0..3 {
        let password = prompt_line("Enter new password (min 8 chars): ")?;
        let confirm_pw = prompt_line("Confirm password: ")?;
        if password != confirm_pw {
            println!("Error: Passwords do not match\n");
            continue;
        }
        match auth.set_password(&password) {
            Ok(()) => {
                println!("\nPassword updated successfully!");
                return Ok(());
            }
            Err(e) => println!("Error: {}\n", e),
        }
    }
    bail!("Unable to reset admin password. Exiting.");
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn confirm(prompt: &str) -> bool {
    matches!(
        prompt_line(prompt).as_deref(),
        Ok("y") | Ok("Y")
    )
}
