//! genesis command-line front end
//!
//! Runs one isolated op against the configured provider chain and prints
//! the resulting `OpResult` as JSON. Also exposes the conversation and
//! vector memory stores for inspection.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genesis_core::{
    ConversationManager, LlmProvider, OpExecutor, OpSpec, ProviderEmbedder, ReactLoop, Role, StepEvent,
    VectorMemory,
};
use genesis_runtime::{RuntimeConfig, default_tools};

#[derive(Parser)]
#[command(name = "genesis", version, about = "Run isolated agent ops")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one op and print its result as JSON
    Run {
        /// What the op must achieve
        objective: String,
        /// Tool the op may use (repeatable)
        #[arg(long = "tool", default_values_t = vec!["shell".to_string()])]
        tools: Vec<String>,
        /// Known fact handed to the executor (repeatable)
        #[arg(long = "fact")]
        facts: Vec<String>,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        expected: Option<String>,
        #[arg(long, default_value_t = genesis_core::contract::DEFAULT_MAX_ITERATIONS)]
        max_iterations: usize,
        /// Record objective and outcome in this conversation
        #[arg(long, env = "GENESIS_SESSION")]
        session: Option<String>,
    },
    /// Check every provider in the failover chain
    Providers,
    /// Print a conversation
    History {
        session: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Store a note in vector memory
    Remember { text: String },
    /// Search vector memory
    Recall {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();
    let router = Arc::new(config.build_router()?);

    match cli.command {
        Commands::Run {
            objective,
            tools,
            facts,
            strategy,
            expected,
            max_iterations,
            session,
        } => {
            let mut builder = OpSpec::builder(objective.clone())
                .tools(tools)
                .facts(facts)
                .max_iterations(max_iterations);
            if let Some(hint) = strategy {
                builder = builder.strategy_hint(hint);
            }
            if let Some(expected) = expected {
                builder = builder.expected_output(expected);
            }
            let spec = builder.build()?;

            let executor = OpExecutor::new(
                Arc::new(default_tools(&config)),
                router.clone(),
                Arc::new(ReactLoop::new(config.react_config())),
            )
            .with_timeout(config.op_timeout);

            let result = executor
                .execute_with_observer(&spec, &mut |event: &StepEvent| match event {
                    StepEvent::LoopStart(n) => tracing::info!(iteration = n, "step"),
                    StepEvent::Tool { name, args } => tracing::info!(tool = %name, %args, "tool call"),
                    StepEvent::ToolResult { name, result } => {
                        tracing::debug!(tool = %name, chars = result.len(), "tool result");
                    }
                })
                .await;

            if let Some(session) = session {
                let conversations = ConversationManager::new(config.conversations_dir())?;
                conversations.add_message(&session, Role::User, objective, None)?;
                let outcome = result
                    .summary()
                    .map(str::to_string)
                    .or_else(|| result.error.clone())
                    .unwrap_or_default();
                conversations.add_message(&session, Role::Assistant, outcome, None)?;
            }

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Providers => {
            let active = router.active_provider_name().to_string();
            for (name, provider) in router.providers() {
                let healthy = provider.health_check().await.unwrap_or(false);
                let marker = if name == active { "*" } else { " " };
                println!("{marker} {name:<12} {}", if healthy { "ok" } else { "unreachable" });
            }
        }
        Commands::History { session, limit } => {
            let conversations = ConversationManager::new(config.conversations_dir())?;
            let summary = conversations
                .summary(&session)
                .with_context(|| format!("no conversation named {session}"))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            for msg in conversations.get_messages(&session, limit, None) {
                println!("[{}] {}: {}", msg.timestamp.format("%Y-%m-%d %H:%M:%S"), msg.role, msg.content);
            }
        }
        Commands::Remember { text } => {
            let memory = VectorMemory::open(config.memory_path(), Some(Arc::new(ProviderEmbedder(router))));
            let embedding = memory.add(text, None).await?;
            println!("stored ({} dimensions, {} items)", embedding.len(), memory.len().await);
        }
        Commands::Recall { query, limit } => {
            let memory = VectorMemory::open(config.memory_path(), Some(Arc::new(ProviderEmbedder(router))));
            for hit in memory.search(&query, limit).await? {
                println!("{:.3}  {}", hit.score, hit.content);
            }
        }
    }

    Ok(())
}
