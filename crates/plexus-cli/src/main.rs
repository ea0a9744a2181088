use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use clap::{Args, Parser, Subcommand};
use plexus_ai::{
    build_adapter, Conversation, FalImageAdapter, Message, PlexusError, PredictOptions,
    ProviderKind, Role, ToolDefinition, ToolInvokeError, Toolkit,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{default_log_dir, load_cli_config, CliConfig};

#[derive(Parser, Debug)]
#[command(name = "plexus", version, about = "Run prompts against hosted model backends")]
struct Cli {
    /// Config file, defaults to ~/.plexus/plexus.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Mirror logs to stderr
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Send one prompt and print the reply
    Chat(ChatArgs),
    /// Send one prompt and print the reply as it arrives
    Stream(ChatArgs),
    /// Generate one image and print its URL
    Image(ImageArgs),
    /// Generate one image per prompt, concurrently
    BatchImages(BatchImagesArgs),
}

#[derive(Args, Debug, Clone)]
struct ChatArgs {
    #[arg(long, default_value = "groq")]
    provider: ProviderKind,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    max_tokens: Option<u32>,
    /// Offer an `add` tool to the model
    #[arg(long, default_value_t = false)]
    calculator: bool,
    prompt: String,
}

#[derive(Args, Debug, Clone)]
struct ImageArgs {
    #[arg(long)]
    model: Option<String>,
    prompt: String,
}

#[derive(Args, Debug, Clone)]
struct BatchImagesArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_concurrent: Option<usize>,
    #[arg(required = true)]
    prompts: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match load_cli_config(cli.config.as_deref()) {
        Ok(config) => run(cli.command, config).await,
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(command: Command, config: CliConfig) -> Result<(), String> {
    match command {
        Command::Chat(args) => run_chat(args, &config).await,
        Command::Stream(args) => run_stream(args, &config).await,
        Command::Image(args) => run_image(args, &config).await,
        Command::BatchImages(args) => run_batch_images(args, &config).await,
    }
    .map_err(|error| error.to_string())
}

fn chat_conversation(args: &ChatArgs) -> Conversation {
    let mut conversation = match &args.system {
        Some(system) => Conversation::with_system(system.clone()),
        None => Conversation::new(),
    };
    conversation.append(Message::human(args.prompt.clone()));
    conversation
}

fn chat_options(args: &ChatArgs) -> PredictOptions {
    let mut options = PredictOptions::default();
    if let Some(temperature) = args.temperature {
        options = options.with_temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        options = options.with_max_tokens(max_tokens);
    }
    if args.calculator {
        options = options.with_toolkit(Arc::new(calculator_toolkit()));
    }
    options
}

fn calculator_toolkit() -> Toolkit {
    Toolkit::new().with_tool(ToolDefinition::new(
        "add",
        "Add two numbers and return the sum",
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["a", "b"]
        }),
        |args: Value| -> Result<Value, ToolInvokeError> {
            if let (Some(a), Some(b)) = (args["a"].as_i64(), args["b"].as_i64()) {
                return Ok(json!(a.saturating_add(b)));
            }
            let a = args["a"].as_f64().ok_or("argument `a` is not a number")?;
            let b = args["b"].as_f64().ok_or("argument `b` is not a number")?;
            Ok(json!(a + b))
        },
    ))
}

async fn run_chat(args: ChatArgs, config: &CliConfig) -> Result<(), PlexusError> {
    let adapter = build_adapter(
        args.provider,
        config.adapter_config(args.provider, args.model.as_deref()),
    )?;
    let mut conversation = chat_conversation(&args);
    let first_new = conversation.len();

    adapter
        .apredict(&mut conversation, &chat_options(&args))
        .await?;

    for message in &conversation.messages()[first_new..] {
        match message.role {
            Role::Tool => println!(
                "[tool {}] {}",
                message.name.as_deref().unwrap_or("?"),
                message.content
            ),
            _ if !message.content.is_empty() => println!("{}", message.content),
            _ => {}
        }
    }
    if let Some(usage) = conversation.last().and_then(|message| message.usage) {
        info!(
            prompt_tokens = usage.prompt_tokens(),
            completion_tokens = usage.completion_tokens(),
            total_ms = usage.total_time().as_millis() as u64,
            "chat finished"
        );
    }
    Ok(())
}

async fn run_stream(args: ChatArgs, config: &CliConfig) -> Result<(), PlexusError> {
    let adapter = build_adapter(
        args.provider,
        config.adapter_config(args.provider, args.model.as_deref()),
    )?;
    let mut conversation = chat_conversation(&args);
    let options = chat_options(&args);

    let mut stdout = std::io::stdout();
    let mut stream = adapter.astream(&mut conversation, &options).await?;
    while let Some(fragment) = stream.next().await {
        let _ = write!(stdout, "{}", fragment?);
        let _ = stdout.flush();
    }
    drop(stream);
    println!();

    info!(messages = conversation.len(), "stream finished");
    Ok(())
}

fn image_adapter(model: Option<&str>, config: &CliConfig) -> Result<FalImageAdapter, PlexusError> {
    Ok(
        FalImageAdapter::new(config.adapter_config(ProviderKind::FalImage, model))?
            .with_poller(config.poller),
    )
}

async fn run_image(args: ImageArgs, config: &CliConfig) -> Result<(), PlexusError> {
    let adapter = image_adapter(args.model.as_deref(), config)?;
    let url = adapter.agenerate_image(&args.prompt).await?;
    println!("{url}");
    Ok(())
}

async fn run_batch_images(args: BatchImagesArgs, config: &CliConfig) -> Result<(), PlexusError> {
    let adapter = image_adapter(args.model.as_deref(), config)?;
    let max_concurrent = args.max_concurrent.unwrap_or(config.max_concurrent);
    let urls = adapter.abatch_images(args.prompts.clone(), max_concurrent).await?;
    for (prompt, url) in args.prompts.iter().zip(urls) {
        println!("{prompt}\t{url}");
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let log_dir = default_log_dir();
    if let Err(error) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            log_dir.display()
        );
        return;
    }

    let appender = tracing_appender::rolling::never(&log_dir, "plexus.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_accepts_chat_with_provider_and_tools() {
        let parsed = Cli::try_parse_from([
            "plexus",
            "chat",
            "--provider",
            "deepseek",
            "--calculator",
            "--temperature",
            "0.2",
            "what is 2 + 2?",
        ])
        .expect("chat should parse");

        let Command::Chat(args) = parsed.command else {
            panic!("expected chat command");
        };
        assert_eq!(args.provider, ProviderKind::Deepseek);
        assert!(args.calculator);
        assert_eq!(args.temperature, Some(0.2));
    }

    #[test]
    fn cli_rejects_unknown_provider() {
        let parsed = Cli::try_parse_from(["plexus", "stream", "--provider", "openai", "hi"]);
        assert!(parsed.is_err(), "unknown providers should be rejected");
    }

    #[test]
    fn cli_accepts_global_config_flag() {
        let parsed = Cli::try_parse_from([
            "plexus",
            "--config",
            "/tmp/plexus.toml",
            "image",
            "a lighthouse at dusk",
        ]);
        assert!(parsed.is_ok(), "plexus should accept --config as global flag");
    }

    #[test]
    fn batch_images_requires_at_least_one_prompt() {
        assert!(Cli::try_parse_from(["plexus", "batch-images"]).is_err());
        let parsed = Cli::try_parse_from([
            "plexus",
            "batch-images",
            "--max-concurrent",
            "2",
            "a",
            "b",
        ])
        .expect("batch-images should parse");
        let Command::BatchImages(args) = parsed.command else {
            panic!("expected batch-images command");
        };
        assert_eq!(args.prompts, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(args.max_concurrent, Some(2));
    }

    #[test]
    fn chat_options_attach_calculator_toolkit() {
        let parsed = Cli::try_parse_from([
            "plexus",
            "chat",
            "--calculator",
            "--max-tokens",
            "64",
            "hi",
        ])
        .expect("chat should parse");
        let Command::Chat(args) = parsed.command else {
            panic!("expected chat command");
        };
        let options = chat_options(&args);
        assert_eq!(options.max_tokens, 64);
        assert_eq!(options.resolved_tool_choice().as_deref(), Some("auto"));

        let toolkit = options.toolkit.expect("toolkit attached");
        let sum = toolkit
            .get("add")
            .and_then(|tool| tool.invoke(json!({ "a": 1.5, "b": 2 })).map_err(|error| {
                PlexusError::new(plexus_ai::PlexusErrorCode::ToolExecutionFailed, error.to_string())
            }))
            .expect("add should run");
        assert_eq!(sum, json!(3.5));
    }

    #[test]
    fn chat_conversation_starts_with_optional_system_prompt() {
        let parsed = Cli::try_parse_from(["plexus", "chat", "--system", "be brief", "hello"])
            .expect("chat should parse");
        let Command::Chat(args) = parsed.command else {
            panic!("expected chat command");
        };
        let conversation = chat_conversation(&args);
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last_content(Role::System), Some("be brief"));
        assert_eq!(conversation.last_content(Role::Human), Some("hello"));
    }
}
