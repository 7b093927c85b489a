use std::{net::SocketAddr, path::Path, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP clients and echoing chat to stdout.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Milliseconds a new connection may take to send its username; 0 waits forever.
    #[arg(long, default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Milliseconds a client may take to accept a frame before it is dropped; 0 waits forever.
    #[arg(long, default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Largest image a client may send, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_image_bytes: usize,
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout: millis(self.handshake_timeout_ms),
            max_image_bytes: self.max_image_bytes,
            write_timeout: millis(self.write_timeout_ms),
        }
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username announced to the relay.
    #[arg(long)]
    pub username: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,
}

/// One line typed at the terminal, by a chat client or the relay operator.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Blank,
    /// `/image <path>`: send a file as an IMAGE frame.
    Image(&'a Path),
    /// Any other bare `/word`; see [`Input::is_command`].
    Command(&'a str),
    Message(&'a str),
}

impl<'a> Input<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Input::Blank;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Message(line);
        };
        match command.split_once(char::is_whitespace) {
            Some(("image", path)) if !path.trim().is_empty() => Input::Image(Path::new(path.trim())),
            Some(_) => Input::Message(line),
            None => Input::Command(command),
        }
    }

    pub fn is_command(&self, name: &str) -> bool {
        matches!(self, Input::Command(command) if command.eq_ignore_ascii_case(name))
    }
}
