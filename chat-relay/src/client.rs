use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::{ClientArgs, Input},
    frame::{ChannelError, Frame, read_frame, write_frame, write_string},
    relay::RelayConfig,
};

const QUIT_COMMAND: &str = "quit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_string(&mut writer, &args.username)
        .await
        .context("failed to send username")?;
    print_line(Stream::Stdout, &format!("*** connected as {}", args.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let mut frames = spawn_frame_reader(reader);
    run_client_loop(&mut frames, &mut writer, &mut stdin, &mut input).await?;
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "connection already gone at shutdown");
    }

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Frame reads are not cancel safe, so they run on their own task and
/// arrive over a channel the client loop can `select!` on.
fn spawn_frame_reader(
    mut reader: BufReader<OwnedReadHalf>,
) -> mpsc::Receiver<Result<Frame, ChannelError>> {
    let max_image_bytes = RelayConfig::default().max_image_bytes;
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader, max_image_bytes).await;
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn run_client_loop(
    frames: &mut mpsc::Receiver<Result<Frame, ChannelError>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            frame = frames.recv() => {
                let frame = frame.unwrap_or(Err(ChannelError::Closed));
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            // read_line keeps partial input in `input` if the other branch wins.
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, writer).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            interrupted = tokio::signal::ctrl_c() => {
                if let Err(error) = interrupted {
                    warn!(?error, "ctrl-c listener failed; leaving");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(frame: Result<Frame, ChannelError>) -> Result<bool> {
    let (line, connected) = match frame {
        Ok(Frame::Text(text)) => (text, true),
        Ok(Frame::Image(bytes)) => (format!("[image: {} bytes]", bytes.len()), true),
        Err(ChannelError::Closed) => ("*** server closed the connection".to_string(), false),
        Err(err) => {
            print_line(Stream::Stderr, &format!("!!! connection lost: {err}")).await?;
            return Ok(false);
        }
    };
    print_line(Stream::Stdout, &line).await?;
    Ok(connected)
}

/// Turns one stdin line into at most one outbound frame. Returns `false` to leave.
async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let frame = match Input::parse(input) {
        Input::Blank => return Ok(true),
        quit if quit.is_command(QUIT_COMMAND) => {
            print_line(Stream::Stdout, "*** leaving chat").await?;
            return Ok(false);
        }
        Input::Image(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Frame::Image(bytes),
            Err(err) => {
                let warning = format!("!!! cannot read {}: {err}", path.display());
                print_line(Stream::Stderr, &warning).await?;
                return Ok(true);
            }
        },
        // Unknown commands go out as plain text, like the relay would show them.
        Input::Command(_) | Input::Message(_) => Frame::Text(input.trim_end().to_string()),
    };
    write_frame(writer, &frame).await?;
    Ok(true)
}

#[derive(Debug, Clone, Copy)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Writes `line` plus a newline and flushes, so transcripts stay line-buffered.
pub async fn print_line(stream: Stream, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    match stream {
        Stream::Stdout => {
            let mut out = tokio::io::stdout();
            out.write_all(&buf).await?;
            out.flush().await
        }
        Stream::Stderr => {
            let mut out = tokio::io::stderr();
            out.write_all(&buf).await?;
            out.flush().await
        }
    }
}
