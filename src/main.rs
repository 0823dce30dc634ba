use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petrel::config::Config;

#[derive(Parser)]
#[command(name = "petrel")]
#[command(about = "Workflow orchestration over place/transition nets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflows on a running server
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Start the server (API + notification dispatcher)
    Server {
        /// Port to listen on (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// Submit a workflow document (JSON, or YAML by extension)
    Submit {
        /// Path to the workflow document
        file: String,
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// List all workflows
    List {
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// Show a workflow's status and history
    Show {
        /// Workflow ID
        id: String,
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// Show a workflow's outputs
    Outputs {
        /// Workflow ID
        id: String,
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// Cancel a running workflow
    Cancel {
        /// Workflow ID
        id: String,
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// Delete a workflow and all its records
    Delete {
        /// Workflow ID
        id: String,
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:8082")]
        url: String,
    },
    /// Validate and compile a document locally without submitting
    Validate {
        /// Path to the workflow document
        file: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "petrel=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Workflows { action } => match action {
            WorkflowActions::Submit { file, url } => cmd_workflows_submit(&file, &url).await?,
            WorkflowActions::List { url } => cmd_workflows_list(&url).await?,
            WorkflowActions::Show { id, url } => cmd_workflows_show(&id, &url).await?,
            WorkflowActions::Outputs { id, url } => cmd_workflows_outputs(&id, &url).await?,
            WorkflowActions::Cancel { id, url } => cmd_workflows_cancel(&id, &url).await?,
            WorkflowActions::Delete { id, url } => cmd_workflows_delete(&id, &url).await?,
            WorkflowActions::Validate { file } => cmd_workflows_validate(&file)?,
        },
        Commands::Server { port } => cmd_server(port).await?,
        Commands::Completions { shell } => cmd_completions(shell)?,
    }

    Ok(())
}

/// Shell completion variants
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Server
// ============================================================================

async fn cmd_server(port: Option<u16>) -> anyhow::Result<()> {
    use petrel::api::{create_router, AppState};
    use petrel::clients::{HttpJobClient, NetClient};
    use petrel::coordinator::Coordinator;
    use petrel::outbox::{Dispatcher, HttpSender};
    use petrel::store::Store;
    use std::sync::Arc;

    let mut config = Config::load();
    if let Some(port) = port {
        config.server.port = port;
    }

    let database_path = config.database_path();
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open(&database_path)?;

    let net = NetClient::new(&config)?;
    let jobs = Arc::new(HttpJobClient::new(&config)?);
    let coordinator = Coordinator::new(store.clone(), config.clone(), jobs);

    let dispatcher = Dispatcher::new(store.clone(), config.outbox.clone(), HttpSender::new()?);
    tokio::spawn(dispatcher.run());

    let state = AppState {
        coordinator,
        net,
        config: config.clone(),
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("petrel server running on http://{}", addr);
    println!();
    println!("  Database:  {}", database_path.display());
    println!("  Net:       {}", config.services.net_url);
    println!("  Jobs:      {}", config.services.job_url);
    println!("  Callbacks: {}", config.callback_base_url());
    println!();
    println!("API endpoints:");
    println!("  GET    /health");
    println!("  POST   /v1/workflows");
    println!("  GET    /v1/workflows");
    println!("  GET    /v1/workflows/{{id}}");
    println!("  GET    /v1/workflows/{{id}}/details");
    println!("  GET    /v1/workflows/{{id}}/outputs");
    println!("  GET    /v1/workflows/{{id}}/submission");
    println!("  PATCH  /v1/workflows/{{id}}");
    println!("  DELETE /v1/workflows/{{id}}");
    println!("  GET    /v1/executions/{{id}}");
    println!("  PATCH  /v1/executions/{{id}}");
    println!("  POST   /v1/callbacks/tasks/{{id}}");
    println!("  POST   /v1/callbacks/methods/{{id}}");
    println!();
    println!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down gracefully...");
}

// ============================================================================
// Workflow Commands
// ============================================================================

fn client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

/// Bail with the server's error body when a request is rejected.
async fn expect_success(response: reqwest::Response) -> anyhow::Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("server returned {}: {}", status, body)
}

async fn cmd_workflows_submit(file: &str, url: &str) -> anyhow::Result<()> {
    let path = std::path::Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let document = petrel::document::parse_document_file(path)?;

    let response = client()?
        .post(format!("{}/v1/workflows", url.trim_end_matches('/')))
        .json(&document)
        .send()
        .await?;
    let body = expect_success(response).await?;

    println!(
        "✓ Workflow '{}' submitted",
        body["name"].as_str().unwrap_or("?")
    );
    println!();
    println!("  ID:      {}", body["id"].as_str().unwrap_or("?"));
    println!("  Net key: {}", body["net_key"].as_str().unwrap_or("?"));
    println!();
    println!(
        "Watch with: petrel workflows show {}",
        body["id"].as_str().unwrap_or("<id>")
    );
    Ok(())
}

async fn cmd_workflows_list(url: &str) -> anyhow::Result<()> {
    let response = client()?
        .get(format!("{}/v1/workflows", url.trim_end_matches('/')))
        .send()
        .await?;
    let body = expect_success(response).await?;

    let workflows = body["workflows"].as_array().cloned().unwrap_or_default();
    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Submit one with: petrel workflows submit <file>");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<10}", "ID", "NAME", "STATUS");
    println!("{}", "-".repeat(74));
    for wf in workflows {
        println!(
            "{:<38} {:<24} {:<10}",
            wf["id"].as_str().unwrap_or("?"),
            wf["name"].as_str().unwrap_or("?"),
            wf["status"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_workflows_show(id: &str, url: &str) -> anyhow::Result<()> {
    let response = client()?
        .get(format!("{}/v1/workflows/{}", url.trim_end_matches('/'), id))
        .send()
        .await?;
    let body = expect_success(response).await?;

    println!("Workflow: {}", body["name"].as_str().unwrap_or("?"));
    println!("  ID:       {}", body["id"].as_str().unwrap_or("?"));
    println!("  Status:   {}", body["status"].as_str().unwrap_or("-"));
    println!("  Net key:  {}", body["net_key"].as_str().unwrap_or("-"));
    println!(
        "  Canceled: {}",
        if body["canceled"].as_bool().unwrap_or(false) {
            "yes"
        } else {
            "no"
        }
    );

    let history = body["status_history"].as_array().cloned().unwrap_or_default();
    if !history.is_empty() {
        println!();
        println!("History:");
        for entry in history {
            println!(
                "  {:<10} {}",
                entry["status"].as_str().unwrap_or("?"),
                entry["at"].as_str().unwrap_or("?"),
            );
        }
    }
    Ok(())
}

async fn cmd_workflows_outputs(id: &str, url: &str) -> anyhow::Result<()> {
    let response = client()?
        .get(format!(
            "{}/v1/workflows/{}/outputs",
            url.trim_end_matches('/'),
            id
        ))
        .send()
        .await?;
    let body = expect_success(response).await?;
    println!("{}", serde_json::to_string_pretty(&body["outputs"])?);
    Ok(())
}

async fn cmd_workflows_cancel(id: &str, url: &str) -> anyhow::Result<()> {
    let response = client()?
        .patch(format!("{}/v1/workflows/{}", url.trim_end_matches('/'), id))
        .json(&serde_json::json!({"is_canceled": true}))
        .send()
        .await?;
    expect_success(response).await?;
    println!("✓ Workflow {} canceled", id);
    Ok(())
}

async fn cmd_workflows_delete(id: &str, url: &str) -> anyhow::Result<()> {
    let response = client()?
        .delete(format!("{}/v1/workflows/{}", url.trim_end_matches('/'), id))
        .send()
        .await?;
    expect_success(response).await?;
    println!("✓ Workflow {} deleted", id);
    Ok(())
}

fn cmd_workflows_validate(file: &str) -> anyhow::Result<()> {
    let path = std::path::Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let document = petrel::document::parse_document_file(path)?;
    let built = petrel::graph::build(&document)?;
    let config = Config::load();
    let plan = petrel::net::translate(&config, &built);

    println!("✓ Document is valid");
    println!();
    println!("  Workflow:    {}", built.name);
    println!("  Transitions: {}", plan.transitions.len());
    Ok(())
}
