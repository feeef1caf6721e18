use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};

use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use chatrelay::api::{self, AppState};
use chatrelay::chat::{Conversation, DEFAULT_CONTEXT_WINDOW, KNOWN_MODELS, Role};
use chatrelay::client::{
    ChatController, ControllerOptions, DEFAULT_COOLDOWN, LocalCache, RelayClient, SettingsPanel,
    TieredHistory, WelcomeTier,
};
use chatrelay::history::{HistoryRepository, StorageConfig};
use chatrelay::relay::RelayConfig;
use chatrelay::upstream::{UpstreamClient, UpstreamConfig};

const APP_NAME: &str = "chatrelay";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_chat(ctx: RuntimeContext, cmd: ChatCommand) -> Result<()> {
    handle_chat(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Chat(cmd) => async_chat(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Chatrelay - streaming chat relay for OpenAI-compatible APIs.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay HTTP server
    Serve(ServeCommand),
    /// Chat with a running relay server from the terminal
    Chat(ChatCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (defaults to server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (defaults to server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct ChatCommand {
    /// Relay server base URL (defaults to client.server_url)
    #[arg(long, value_name = "URL")]
    server: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    /// Level from CLI flags, falling back to `logging.level` from config.
    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    fn cache_dir(&self) -> Result<PathBuf> {
        match self.config.client.cache_dir {
            Some(ref dir) => expand_str_path(dir),
            None => Ok(self.paths.data_dir.join("client")),
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    server: ServerConfig,
    upstream: UpstreamConfig,
    relay: RelayConfig,
    storage: StorageConfig,
    client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Browser origins allowed to call the API. Empty means localhost only.
    allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ClientConfig {
    server_url: String,
    /// Local cache directory. Defaults to `<data dir>/client`.
    cache_dir: Option<String>,
    context_window: usize,
    cooldown_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            cache_dir: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
            cooldown_ms: DEFAULT_COOLDOWN.as_millis() as u64,
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting chat relay server...");

    let db_path = ctx.config.storage.resolve(&ctx.paths.data_dir)?;
    info!("Database path: {}", db_path.display());
    let history = Arc::new(HistoryRepository::open(&db_path).await?);

    let upstream_config = ctx.config.upstream.clone().with_env_fallbacks();
    let upstream = UpstreamClient::new(&upstream_config).context("creating upstream client")?;
    if upstream.is_configured() {
        info!("Upstream endpoint: {}", upstream.endpoint());
    } else {
        warn!("No upstream API key configured; answering with mock replies");
    }

    let state = AppState::new(upstream, history.clone(), ctx.config.relay.clone())
        .with_allowed_origins(ctx.config.server.allowed_origins.clone());
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    history.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn handle_chat(ctx: &RuntimeContext, cmd: ChatCommand) -> Result<()> {
    let server = cmd
        .server
        .unwrap_or_else(|| ctx.config.client.server_url.clone());
    let cache = LocalCache::in_dir(ctx.cache_dir()?);

    let relay = Arc::new(RelayClient::new(&server)?.with_cache(cache.clone()).await);
    let history = TieredHistory::new()
        .with_tier(relay.clone())
        .with_tier(Arc::new(cache.clone()))
        .with_tier(Arc::new(WelcomeTier));
    debug!("history tiers: {:?}", history.tier_names());
    let conversation = history.load().await;

    let mut panel = SettingsPanel::mount(cache.clone()).await;
    let options = ControllerOptions {
        context_window: ctx.config.client.context_window.max(1),
        cooldown: Duration::from_millis(ctx.config.client.cooldown_ms),
    };
    let mut chat = ChatController::new(relay.clone(), cache, conversation, options)
        .with_remote_history(relay)
        .with_settings(panel.current().clone());

    print_transcript(chat.conversation());
    println!(
        "[{} @ {:.1}] type /help for commands",
        chat.settings().model,
        chat.settings().temperature
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("reading input")? else {
            break;
        };
        let line = line.trim();

        match ChatInput::parse(line) {
            ChatInput::Quit => break,
            ChatInput::Help => print_chat_help(),
            ChatInput::Clear => {
                chat.clear().await;
                print_transcript(chat.conversation());
            }
            ChatInput::Export(path) => {
                let Some(path) = path else {
                    println!("usage: /export <path>");
                    continue;
                };
                if ctx.common.dry_run {
                    info!("dry-run: would export conversation to {path}");
                    continue;
                }
                match export_conversation(chat.conversation(), path) {
                    Ok(path) => println!(
                        "exported {} messages to {}",
                        chat.conversation().len(),
                        path.display()
                    ),
                    Err(err) => println!("! export failed: {err:#}"),
                }
            }
            ChatInput::Model(None) => {
                println!("model: {} (known: {})", chat.settings().model, KNOWN_MODELS.join(", "));
            }
            ChatInput::Model(Some(model)) => {
                let settings = panel.set_model(model).await.clone();
                println!("model set to {}", settings.model);
                chat.apply_settings(settings);
            }
            ChatInput::Temperature(None) => {
                println!("temperature: {:.2}", chat.settings().temperature);
            }
            ChatInput::Temperature(Some(raw)) => match raw.parse::<f32>() {
                Ok(value) => {
                    let settings = panel.set_temperature(value).await.clone();
                    println!("temperature set to {:.2}", settings.temperature);
                    chat.apply_settings(settings);
                }
                Err(_) => println!("temperature must be a number between 0 and 1"),
            },
            ChatInput::Last => match chat.last_assistant() {
                Some(message) => println!("{}", message.content),
                None => println!("(no assistant message yet)"),
            },
            ChatInput::Unknown(command) => println!("unknown command {command}, try /help"),
            ChatInput::Text(text) => {
                let base = chat.conversation().len();
                let updates = chat.subscribe();
                let (done_tx, done_rx) = oneshot::channel();

                let exchange = async {
                    let result = chat.send(text).await;
                    let _ = done_tx.send(());
                    result
                };
                let (result, ()) = tokio::join!(exchange, render_reply(updates, base, done_rx));

                if let Err(rejected) = result {
                    println!("! {rejected}");
                }
            }
        }
    }

    chat.settle().await;
    Ok(())
}

/// Write `conversation` as pretty JSON to `raw_path` (`~` and `$VARS` expanded).
fn export_conversation(conversation: &Conversation, raw_path: &str) -> Result<PathBuf> {
    let path = expand_str_path(raw_path)?;
    let body = conversation
        .export_json()
        .context("serializing conversation")?;
    fs::write(&path, body).with_context(|| format!("writing export to {}", path.display()))?;
    Ok(path)
}

/// A line typed into the chat prompt.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput<'a> {
    Text(&'a str),
    Clear,
    Export(Option<&'a str>),
    Model(Option<&'a str>),
    Temperature(Option<&'a str>),
    Last,
    Help,
    Quit,
    Unknown(&'a str),
}

impl<'a> ChatInput<'a> {
    fn parse(line: &'a str) -> Self {
        let Some(command) = line.strip_prefix('/') else {
            return Self::Text(line);
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (command, None),
        };
        match name {
            "clear" => Self::Clear,
            "export" => Self::Export(arg),
            "model" => Self::Model(arg),
            "temp" | "temperature" => Self::Temperature(arg),
            "last" => Self::Last,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line),
        }
    }
}

fn print_chat_help() {
    println!("/clear            start over from the welcome message");
    println!("/export <path>    write the conversation as JSON");
    println!("/model [id]       show or set the model");
    println!("/temp [0-1]       show or set the temperature");
    println!("/last             repeat the last assistant reply");
    println!("/quit             leave");
}

fn print_transcript(conversation: &Conversation) {
    for message in conversation.messages() {
        match message.role {
            Role::User => println!("you> {}", message.content),
            Role::Assistant => println!("ai> {}", message.content),
        }
    }
}

/// Print assistant text as the controller publishes it, until `done` fires.
async fn render_reply(
    mut updates: watch::Receiver<Conversation>,
    base: usize,
    mut done: oneshot::Receiver<()>,
) {
    let mut printed_index = None;
    let mut printed_len = 0;

    loop {
        let finished = tokio::select! {
            changed = updates.changed() => changed.is_err(),
            _ = &mut done => true,
        };

        let snapshot = updates.borrow_and_update().clone();
        for (index, message) in snapshot.messages().iter().enumerate().skip(base) {
            if message.role != Role::Assistant {
                continue;
            }
            if printed_index != Some(index) {
                if printed_index.is_some() {
                    println!();
                }
                print!("ai> ");
                printed_index = Some(index);
                printed_len = 0;
            }
            if let Some(fresh) = message.content.get(printed_len..) {
                print!("{fresh}");
                printed_len = message.content.len();
            }
        }
        io::stdout().flush().ok();

        if finished {
            break;
        }
    }

    if printed_index.is_some() {
        println!();
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("server.port", 3000_i64)?
        .set_default("relay.stream", true)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# upstream.api_key falls back to OPENAI_API_KEY, upstream.model to OPENAI_MODEL.\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
