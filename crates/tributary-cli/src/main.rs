use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tributary_contracts::events::{event_line, EventEmitter, EventWriter, PipeEvent};
use tributary_contracts::image::{calculate_dimensions, total_megapixels, AspectRatio};
use tributary_contracts::messages::{ChatMessage, PipeOutput, PipeRequest};
use tributary_contracts::valves::{
    ImageValves, WorkflowValves, DEFAULT_BASE_DIMENSION, MAX_NUM_OUTPUTS,
};
use tributary_engine::{default_pipe_registry, ImagePipe, Pipe, WorkflowPipe};

#[derive(Debug, Parser)]
#[command(name = "tributary-rs", version, about = "Run tributary chat pipes from a terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one chat turn through the n8n workflow pipe.
    Workflow(WorkflowArgs),
    /// Generate images through the FLUX Replicate pipe.
    Image(ImageArgs),
    /// Print the dimensions a generation request would use.
    Dims(DimsArgs),
    /// List the registered pipes.
    Pipes(PipesArgs),
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    valves: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    chat_id: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
}

#[derive(Debug, Parser)]
struct WorkflowArgs {
    #[arg(long)]
    message: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct DimsArgs {
    #[arg(long, default_value = "1:1")]
    ratio: String,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long, default_value_t = 4.7)]
    max_mp: f64,
    #[arg(long, default_value_t = DEFAULT_BASE_DIMENSION)]
    base: u32,
}

#[derive(Debug, Parser)]
struct PipesArgs {
    #[arg(long)]
    valves: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tributary-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Workflow(args) => run_workflow(args),
        Command::Image(args) => run_image(args),
        Command::Dims(args) => {
            run_dims(args)?;
            Ok(0)
        }
        Command::Pipes(args) => {
            run_pipes(args)?;
            Ok(0)
        }
    }
}

fn run_workflow(args: WorkflowArgs) -> Result<i32> {
    let valves = WorkflowValves::load(args.session.valves.as_deref())?;
    let pipe = WorkflowPipe::new(valves)?;
    run_pipe(&pipe, &args.message, args.session)
}

fn run_image(args: ImageArgs) -> Result<i32> {
    let valves = ImageValves::load(args.session.valves.as_deref())?;
    let pipe = ImagePipe::new(valves)?;
    run_pipe(&pipe, &args.prompt, args.session)
}

fn run_pipe(pipe: &dyn Pipe, text: &str, session: SessionArgs) -> Result<i32> {
    let chat_id = session
        .chat_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut request = PipeRequest::from_messages(vec![ChatMessage::user(text)])
        .with_chat_id(chat_id.clone());
    if let Some(user_id) = session.user_id {
        request = request.with_user_id(user_id);
    }

    let emitter: Arc<dyn EventEmitter> = match session.events {
        Some(path) => Arc::new(EventWriter::new(path, chat_id.clone())),
        None => Arc::new(StdoutEmitter::new(chat_id.clone())),
    };

    info!(pipe = pipe.id(), chat_id = %chat_id, "running pipe");
    let output = pipe.pipe(request, emitter);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(exit_code(&output))
}

/// The image pipe reports failures as a yielded `Error: ...` chunk.
fn exit_code(output: &PipeOutput) -> i32 {
    let failed = match output {
        PipeOutput::Chunks(chunks) => chunks.iter().any(|chunk| chunk.starts_with("Error: ")),
        other => other.is_error(),
    };
    if failed {
        1
    } else {
        0
    }
}

fn run_dims(args: DimsArgs) -> Result<()> {
    let ratio = AspectRatio::parse(&args.ratio)
        .with_context(|| format!("invalid aspect ratio '{}' (expected W:H)", args.ratio))?;
    if args.count == 0 || args.count > MAX_NUM_OUTPUTS {
        bail!("--count must be between 1 and {MAX_NUM_OUTPUTS}");
    }
    let (width, height) = calculate_dimensions(ratio, args.count, args.max_mp, args.base);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "aspect_ratio": ratio.to_string(),
            "num_outputs": args.count,
            "width": width,
            "height": height,
            "total_megapixels": total_megapixels(width, height, args.count),
        }))?
    );
    Ok(())
}

fn run_pipes(args: PipesArgs) -> Result<()> {
    let pipes = default_pipe_registry(
        WorkflowValves::load(args.valves.as_deref())?,
        ImageValves::load(args.valves.as_deref())?,
    )?;
    for (id, name) in pipes.names() {
        println!("{id}\t{name}");
    }
    Ok(())
}

/// Writes each event to stdout as one JSON line.
struct StdoutEmitter {
    chat_id: String,
    lock: Mutex<()>,
}

impl StdoutEmitter {
    fn new(chat_id: String) -> Self {
        Self {
            chat_id,
            lock: Mutex::new(()),
        }
    }
}

impl EventEmitter for StdoutEmitter {
    fn emit(&self, event: &PipeEvent) -> Result<()> {
        let line = serde_json::to_string(&event_line(event, &self.chat_id)?)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("stdout emitter lock poisoned"))?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tributary_contracts::messages::PipeOutput;

    use super::{exit_code, Cli, Command};

    #[test]
    fn workflow_args_parse_session_flags() {
        let cli = Cli::try_parse_from([
            "tributary-rs",
            "workflow",
            "--message",
            "hello",
            "--chat-id",
            "chat-1",
            "--user-id",
            "u-9",
        ]);
        let Ok(Cli {
            command: Command::Workflow(args),
        }) = cli
        else {
            panic!("workflow subcommand did not parse");
        };
        assert_eq!(args.message, "hello");
        assert_eq!(args.session.chat_id.as_deref(), Some("chat-1"));
        assert_eq!(args.session.user_id.as_deref(), Some("u-9"));
        assert!(args.session.events.is_none());
    }

    #[test]
    fn dims_defaults() {
        let cli = Cli::try_parse_from(["tributary-rs", "dims", "--ratio", "16:9"]);
        let Ok(Cli {
            command: Command::Dims(args),
        }) = cli
        else {
            panic!("dims subcommand did not parse");
        };
        assert_eq!(args.ratio, "16:9");
        assert_eq!(args.count, 1);
        assert_eq!(args.base, 1440);
    }

    #[test]
    fn error_payload_exits_nonzero() {
        assert_eq!(exit_code(&PipeOutput::error("Error: 500 - down")), 1);
        assert_eq!(exit_code(&PipeOutput::Chunks(Vec::new())), 0);
        assert_eq!(
            exit_code(&PipeOutput::Chunks(vec!["Error: REPLICATE_API_TOKEN not set".to_string()])),
            1
        );
    }
}
