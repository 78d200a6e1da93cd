//! CLI entry point for turnloop.
//!
//! The `turnloop` command talks to a hosted model either one request at a
//! time (`ask`) or over a persistent session (`session`), with the built-in
//! tools attached in both cases.

mod tools;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use turnloop_agent::{
    AgentSettings, EventSink, HttpTransport, OrchestratorConfig, ResponseMode, SessionController,
    SessionOptions, TurnOrchestrator, connect_realtime,
};
use turnloop_protocol::{ServerEvent, SessionConfig};

/// How long `session` waits for the handshake before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// turnloop: tool-using conversations with a hosted model.
#[derive(Parser)]
#[command(
    name = "turnloop",
    version,
    about = "turnloop: tool-using conversations with a hosted model",
    long_about = "Sends prompts to a hosted model, runs the tools it calls and feeds their \
                  outputs back until the model answers."
)]
struct Cli {
    /// Settings file. A missing file means defaults.
    #[arg(long, global = true, default_value = "turnloop.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Override the configured model.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question over request/response turns.
    Ask {
        prompt: String,

        /// Wait for complete responses instead of streaming events.
        #[arg(long)]
        no_stream: bool,

        /// Stop after the first turn even if tools were called.
        #[arg(long)]
        single_turn: bool,
    },

    /// Ask one question over a persistent session.
    Session { prompt: String },

    /// Show the effective configuration.
    Status,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = dotenvy::dotenv() {
        debug!(error = %e, "no .env file loaded");
    }

    let mut settings = AgentSettings::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?
        .apply_env();

    match cli.command {
        Commands::Ask {
            prompt,
            no_stream,
            single_turn,
        } => {
            if let Some(model) = cli.model {
                settings.model = model;
            }
            if no_stream {
                settings.streaming = false;
            }
            cmd_ask(&settings, &prompt, !single_turn).await
        }
        Commands::Session { prompt } => {
            if let Some(model) = cli.model {
                settings.realtime_model = model;
            }
            cmd_session(&settings, &prompt).await
        }
        Commands::Status => cmd_status(&settings, &cli.config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: ask
// ---------------------------------------------------------------------------

async fn cmd_ask(settings: &AgentSettings, prompt: &str, auto_iterate: bool) -> Result<()> {
    let transport = HttpTransport::from_settings(settings).context("failed to build transport")?;
    let config = OrchestratorConfig::from(settings);
    let streaming = config.mode == ResponseMode::Streaming;

    let mut orchestrator = TurnOrchestrator::new(Arc::new(transport), config)?
        .with_tools(tools::builtin_tools())?;
    orchestrator.push_user_text(prompt);

    let printer = tokio::spawn(print_deltas(orchestrator.subscribe()?));

    info!(model = %settings.model, streaming, auto_iterate, "asking");
    let result = orchestrator.next_response(auto_iterate).await;
    // Closing the bus lets the printer drain and exit.
    drop(orchestrator);
    let printed = printer.await.unwrap_or(false);

    let outcome = result.context("conversation failed")?;
    match outcome.output_text() {
        Some(text) if !printed => println!("{text}"),
        Some(_) => println!(),
        None => {
            for item in &outcome.tool_outputs {
                println!("{}", serde_json::to_string(item)?);
            }
        }
    }

    info!(
        turns = outcome.turns_used,
        input_tokens = outcome.usage.input_tokens,
        output_tokens = outcome.usage.output_tokens,
        "done"
    );
    Ok(())
}

/// Echo text deltas as they arrive.  Returns whether anything was printed.
async fn print_deltas(mut rx: broadcast::Receiver<Arc<ServerEvent>>) -> bool {
    let mut printed = false;
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let ServerEvent::OutputTextDelta { delta, .. } = event.as_ref() {
                    print!("{delta}");
                    let _ = io::stdout().flush();
                    printed = true;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "output display fell behind"),
            Err(RecvError::Closed) => return printed,
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: session
// ---------------------------------------------------------------------------

async fn cmd_session(settings: &AgentSettings, prompt: &str) -> Result<()> {
    let api_key = settings.require_api_key()?;
    let (sink, events) = connect_realtime(&settings.realtime_url, &settings.realtime_model, api_key)
        .await
        .context("failed to open session")?;

    let initial = SessionConfig {
        instructions: settings.instructions.clone(),
        modalities: Some(vec!["text".into()]),
        temperature: settings.temperature,
        ..SessionConfig::default()
    };
    let options = SessionOptions::default()
        .with_session(initial)
        .with_tools(tools::builtin_tools());

    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let controller = SessionController::start(sink, events, options)?;
    let mut inbound = controller.inbound().subscribe()?;
    let mut errors = controller.errors().subscribe()?;

    let result = converse(&controller, &mut inbound, &mut errors, prompt).await;
    controller.dispose().await?;
    result
}

async fn converse(
    controller: &SessionController,
    inbound: &mut broadcast::Receiver<Arc<ServerEvent>>,
    errors: &mut broadcast::Receiver<Arc<turnloop_agent::SessionError>>,
    prompt: &str,
) -> Result<()> {
    tokio::time::timeout(READY_TIMEOUT, controller.wait_until_ready())
        .await
        .context("timed out waiting for the session")??;
    info!(session = %controller.id(), "session ready");

    controller.send_user_text(prompt).await?;

    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Ok(event) => match event.as_ref() {
                    ServerEvent::OutputTextDelta { delta, .. } => {
                        print!("{delta}");
                        let _ = io::stdout().flush();
                    }
                    // A response that only called tools is followed by another
                    // one once their outputs are delivered.
                    ServerEvent::ResponseDone { response, .. } => {
                        if response.function_calls().next().is_none() {
                            println!();
                            return Ok(());
                        }
                        debug!(response_id = %response.id, "waiting for tool follow-up");
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output display fell behind"),
                Err(RecvError::Closed) => bail!("session ended before the response finished"),
            },
            error = errors.recv() => match error {
                Ok(error) => bail!("session error: {error}"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("session ended before the response finished"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(settings: &AgentSettings, config_path: &std::path::Path) -> Result<()> {
    println!();
    println!("  turnloop Status");
    println!("  ===============");
    println!();

    if config_path.exists() {
        println!("  Config:           OK ({})", config_path.display());
    } else {
        println!("  Config:           DEFAULTS ({} not found)", config_path.display());
    }

    match settings.api_key {
        Some(_) => println!("  API key:          CONFIGURED"),
        None => println!("  API key:          NOT SET (TURNLOOP_API_KEY or OPENAI_API_KEY)"),
    }

    println!("  Endpoint:         {}", settings.base_url);
    println!("  Realtime:         {}", settings.realtime_url);
    println!("  Model:            {}", settings.model);
    println!("  Realtime model:   {}", settings.realtime_model);
    println!(
        "  Mode:             {}",
        if settings.streaming { "streaming" } else { "blocking" }
    );
    println!(
        "  History:          {}",
        if settings.use_server_state {
            "server-side (previous response id)"
        } else {
            "client-side (full input)"
        }
    );
    match settings.max_turns {
        Some(max) => println!("  Turn limit:       {max}"),
        None => println!("  Turn limit:       none"),
    }

    let tools = tools::builtin_tools();
    let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
    println!("  Tools:            {}", names.join(", "));

    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask_flags() {
        let cli = Cli::try_parse_from([
            "turnloop",
            "ask",
            "what time is it?",
            "--no-stream",
            "--single-turn",
        ])
        .unwrap();
        match cli.command {
            Commands::Ask {
                prompt,
                no_stream,
                single_turn,
            } => {
                assert_eq!(prompt, "what time is it?");
                assert!(no_stream);
                assert!(single_turn);
            }
            _ => panic!("expected ask"),
        }
        assert_eq!(cli.config, PathBuf::from("turnloop.toml"));
    }

    #[test]
    fn global_options_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "turnloop",
            "session",
            "hello",
            "--model",
            "some-model",
            "--config",
            "alt.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Session { .. }));
        assert_eq!(cli.model.as_deref(), Some("some-model"));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn prompt_is_required() {
        assert!(Cli::try_parse_from(["turnloop", "ask"]).is_err());
    }
}
