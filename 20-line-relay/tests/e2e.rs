use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use line_relay::protocol::{EXIT_KEYWORD, LineReader, write_line};
use tokio::{
    io::BufReader,
    process::{Child, ChildStdin, ChildStdout, Command},
    select,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

type OutputLines = LineReader<BufReader<ChildStdout>>;

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("line_relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Keep reading relay logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(collect_relay_log(server_stdout));

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    let mut bob = spawn_client(&binary, "bob", &addr).await?;

    // Whoever registered first sees the other one join.
    let first_join = select! {
        line = alice.expect("alice to see bob") => line?,
        line = bob.expect("bob to see alice") => line?,
    };
    assert!(
        first_join == "bob joined" || first_join == "alice joined",
        "unexpected join notice '{first_join}'"
    );

    // Alice greets Bob; the relay does not echo it back to Alice.
    alice.say("Hello from Alice").await?;
    assert_eq!(bob.expect("bob to hear alice").await?, "alice: Hello from Alice");

    bob.say("Hi Alice!").await?;
    assert_eq!(alice.expect("alice to hear bob").await?, "bob: Hi Alice!");

    // Alice exits; Bob receives the departure notice and never sees "exit".
    alice.leave(EXIT_KEYWORD).await?;
    assert_eq!(bob.expect("bob to see alice leave").await?, "alice left");

    bob.leave("EXIT").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let relay_log = server_log_task.await?;
    assert!(
        relay_log.iter().any(|line| line.contains("session left")),
        "relay never logged a departure: {relay_log:?}"
    );

    Ok(())
}

struct ClientProcess {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: OutputLines,
}

impl ClientProcess {
    async fn say(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.stdin, line)
            .await
            .with_context(|| format!("{} failed to send '{line}'", self.name))
    }

    /// Next line printed by the client, relay notice or status.
    async fn expect(&mut self, waiting_for: &str) -> Result<String> {
        next_output_line(&mut self.stdout)
            .await
            .with_context(|| format!("waiting for {waiting_for}"))?
            .ok_or_else(|| anyhow!("waiting for {waiting_for}: {} stdout closed", self.name))
    }

    /// Types `keyword` and checks the client confirms and exits cleanly.
    async fn leave(mut self, keyword: &str) -> Result<()> {
        self.say(keyword).await?;
        let confirmation = self.expect("disconnect confirmation").await?;
        ensure!(
            confirmation == "*** disconnecting",
            "{} answered '{confirmation}' to {keyword}",
            self.name
        );

        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.name))??;
        ensure!(status.success(), "{} exited with status {status}", self.name);
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, OutputLines)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, LineReader::new(BufReader::new(stdout))))
}

/// The relay logs `relay listening on <addr>` once bound.
async fn read_server_addr(output: &mut OutputLines) -> Result<String> {
    let line = next_output_line(output)
        .await?
        .context("relay did not emit listening address")?;
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    ensure!(
        line.contains("relay listening on") && addr.contains(':'),
        "relay banner missing socket: {line}"
    );
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, name: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        name: name.to_string(),
        child,
        stdin,
        stdout: LineReader::new(BufReader::new(stdout)),
    };

    let banner = process.expect("client banner").await?;
    let expected = format!("*** type '{EXIT_KEYWORD}' to leave");
    ensure!(banner == expected, "unexpected banner for {name}: '{banner}'");

    Ok(process)
}

async fn next_output_line(output: &mut OutputLines) -> Result<Option<String>> {
    timeout(READ_TIMEOUT, output.next_line())
        .await
        .map_err(|_| anyhow!("timed out waiting for line"))?
        .context("failed to read process output")
}

/// Reads relay log lines until the process exits.
async fn collect_relay_log(mut output: OutputLines) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(Some(line)) = output.next_line().await {
        lines.push(line);
    }
    lines
}
