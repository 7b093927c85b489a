use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::warn;

use chat_relay::{
    Relay, RelayEvent,
    cli::{Cli, Command, Input, ServeArgs},
    client::{self, Stream},
    relay::SERVER_LABEL,
};

const STOP_COMMAND: &str = "stop";

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the chat transcript; logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    let result = runtime.block_on(async move {
        match cli.command {
            Command::Serve(args) => serve(args).await,
            Command::Client(args) => client::run(args).await,
        }
    });
    // A pending stdin read sits on a blocking thread that cannot be cancelled.
    runtime.shutdown_background();

    result
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (relay, events) = Relay::new(args.relay_config());
    let display = spawn_display(events);

    relay
        .start(args.listen)
        .await
        .with_context(|| format!("failed to start relay on {}", args.listen))?;

    run_operator_loop(&relay).await?;

    relay.stop().await?;
    if let Err(err) = display.await {
        warn!(error = ?err, "display task failed");
    }
    Ok(())
}

/// Renders relay events on stdout until the relay reports it stopped.
fn spawn_display(mut events: mpsc::UnboundedReceiver<RelayEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let line = match &event {
                RelayEvent::Text { sender, text } => format!("<{sender}> {text}"),
                RelayEvent::Joined { online, .. } | RelayEvent::Left { online, .. } => {
                    format!("*** {event} ({online} online)")
                }
                other => format!("*** {other}"),
            };
            if let Err(err) = client::print_line(Stream::Stdout, &line).await {
                warn!(error = ?err, "failed to render relay event");
            }
            if event == RelayEvent::Stopped {
                break;
            }
        }
    })
}

/// Forwards operator stdin to every client until `/stop` or ctrl-c.
async fn run_operator_loop(relay: &Relay) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut stdin_open = true;

    loop {
        select! {
            bytes_read = stdin.read_line(&mut input), if stdin_open => {
                if bytes_read? == 0 {
                    // Without an operator, keep serving until ctrl-c.
                    stdin_open = false;
                    continue;
                }
                let keep_going = handle_operator_input(relay, &input).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_operator_input(relay: &Relay, line: &str) -> Result<bool> {
    let sent = match Input::parse(line) {
        Input::Blank => return Ok(true),
        stop if stop.is_command(STOP_COMMAND) => return Ok(false),
        Input::Image(path) => match tokio::fs::read(path).await {
            Ok(bytes) => relay.share_image(bytes).await,
            Err(err) => {
                warn!(path = %path.display(), error = ?err, "failed to read image");
                return Ok(true);
            }
        },
        Input::Command(_) | Input::Message(_) => relay.announce(line.trim_end()).await,
    };
    if let Err(err) = sent {
        warn!(sender = SERVER_LABEL, error = %err, "operator message not sent");
    }
    Ok(true)
}
