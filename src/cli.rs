use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "ds-chat",
    version,
    about = "Chat with a domain data-analysis agent backed by an MCP stdio tool server"
)]
pub struct Cli {
    /// Which agent variant to chat with (built-in: provider, anomalies,
    /// explorer; more may be declared in the config file).
    #[arg(long, default_value = "provider")]
    pub agent: String,
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<String>,
    /// Override the tool-server launcher script.
    #[arg(long)]
    pub launcher: Option<String>,
    /// Override the model name.
    #[arg(long)]
    pub model: Option<String>,
    /// Override the model provider endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Read a one-shot question from a file instead of arguments.
    #[arg(long)]
    pub prompt_file: Option<String>,
    /// One-shot question; when omitted, an interactive chat starts.
    #[arg()]
    pub question: Vec<String>,
}
