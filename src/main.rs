use clap::Parser;
use ds_agents::application::chat;
use ds_agents::application::session;
use ds_agents::cli::Cli;
use ds_agents::{AgentDefinition, AppConfig, ConversationState, OpenAiEngine, ToolServerSession};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    debug!(agent = %cli.agent, config = ?cli.config, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let mut config = AppConfig::load(config_path)?;
    if let Some(launcher) = &cli.launcher {
        config.launcher = PathBuf::from(shellexpand::tilde(launcher).into_owned());
    }
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }

    let variant = config.find_variant(&cli.agent).ok_or_else(|| {
        format!(
            "unknown agent '{}'; available: {}",
            cli.agent,
            config.variant_aliases().join(", ")
        )
    })?;
    info!(agent = %variant.name, tools = variant.resolved_tools().len(), "variant selected");

    let question = load_question(&cli)?;
    let engine = OpenAiEngine::from_config(&config);
    let definition = AgentDefinition::for_variant(&variant, &config);

    eprintln!("Starting MCP server for {} …", cli.agent);
    let server_session = ToolServerSession::for_variant(&variant, &config)?;

    session::scoped::<(), Box<dyn Error>, _, _>(server_session, move |server_session| async move {
        let agent = definition.bind(server_session);
        match question {
            Some(question) => {
                let mut state = ConversationState::new();
                let report = chat::dispatch(&engine, &agent, &mut state, &question).await?;
                println!("{}", report.answer.trim());
                Ok(())
            }
            None => {
                // Ctrl-C lands here so the scoped teardown still runs.
                tokio::select! {
                    result = chat::repl(&engine, &agent) => result.map_err(Into::into),
                    _ = tokio::signal::ctrl_c() => {
                        println!("\nBye.");
                        Ok(())
                    }
                }
            }
        }
    })
    .await?;

    info!("chat finished");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
    });
}

fn load_question(cli: &Cli) -> Result<Option<String>, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "loading question from file");
        let content = fs::read_to_string(path)?;
        return Ok(Some(content.trim().to_string()));
    }
    if !cli.question.is_empty() {
        return Ok(Some(cli.question.join(" ").trim().to_string()));
    }
    Ok(None)
}
