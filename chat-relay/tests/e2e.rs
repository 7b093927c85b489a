use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let mut relay = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay.stdout).await?;

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    expect_line(&mut relay.stdout, "*** alice joined the chat (1 online)").await?;
    let mut bob = spawn_client(&binary, "bob", &addr).await?;
    expect_line(&mut relay.stdout, "*** bob joined the chat (2 online)").await?;

    // Alice's message reaches Bob and the relay transcript, never Alice herself.
    alice.send_line("Hello from Alice").await?;
    expect_line(&mut bob.stdout, "alice: Hello from Alice").await?;
    expect_line(&mut relay.stdout, "<alice> Hello from Alice").await?;

    // The operator speaks to everyone.
    relay.send_line("hello all").await?;
    expect_line(&mut relay.stdout, "<server> hello all").await?;
    expect_line(&mut alice.stdout, "Server: hello all").await?;
    expect_line(&mut bob.stdout, "Server: hello all").await?;

    alice.send_line("/quit").await?;
    expect_line(&mut alice.stdout, "*** leaving chat").await?;
    expect_line(&mut relay.stdout, "*** alice left the chat (1 online)").await?;
    ensure_success(&mut alice.child, "alice client").await?;

    // Stopping the relay disconnects Bob.
    relay.send_line("/stop").await?;
    expect_line(&mut relay.stdout, "*** bob left the chat (0 online)").await?;
    expect_line(&mut relay.stdout, "*** Server stopped").await?;
    expect_line(&mut bob.stdout, "*** server closed the connection").await?;

    ensure_success(&mut bob.child, "bob client").await?;
    ensure_success(&mut relay.child, "relay").await?;

    Ok(())
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

fn spawn_process(mut cmd: Command, name: &str) -> Result<Process> {
    cmd.env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {name}"))?;
    let stdin = child
        .stdin
        .take()
        .with_context(|| format!("{name} stdin missing after spawn"))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("{name} stdout missing after spawn"))?;

    Ok(Process {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn spawn_relay(binary: &Path) -> Result<Process> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve").arg("--listen").arg("127.0.0.1:0");
    spawn_process(cmd, "relay")
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let banner = read_line_expect(reader, "waiting for relay banner").await?;
    let addr = banner
        .strip_prefix("*** Server started on ")
        .with_context(|| format!("unexpected relay banner: {banner}"))?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {banner}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, username: &str, addr: &str) -> Result<Process> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--username")
        .arg(username)
        .arg("--server")
        .arg(addr);
    let mut process = spawn_process(cmd, username)?;

    expect_line(&mut process.stdout, &format!("*** connected as {username}")).await?;
    Ok(process)
}

async fn expect_line(reader: &mut BufReader<ChildStdout>, expected: &str) -> Result<()> {
    let line = read_line_expect(reader, &format!("waiting for '{expected}'")).await?;
    if line != expected {
        return Err(anyhow!("expected '{expected}', got '{line}'"));
    }
    Ok(())
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
