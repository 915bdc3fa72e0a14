use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader, Stdin, Stdout},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{ClientLine, EXIT_KEYWORD, LineReader, write_line},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut relay_lines, mut writer) = establish_connection(&args).await?;
    write_line(&mut writer, &args.name)
        .await
        .context("failed to send name")?;

    let mut console = Console::new();
    console
        .status(&format!("type '{EXIT_KEYWORD}' to leave"))
        .await?;

    let mut input_lines = LineReader::new(BufReader::new(io::stdin()));
    run_client_loop(&mut relay_lines, &mut input_lines, &mut writer, &mut console).await?;
    hang_up(&mut writer, args.server).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(LineReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((LineReader::new(BufReader::new(reader)), writer))
}

// Both branches must be cancel safe; `LineReader::next_line` is.
async fn run_client_loop(
    relay_lines: &mut LineReader<BufReader<OwnedReadHalf>>,
    input_lines: &mut LineReader<BufReader<Stdin>>,
    writer: &mut OwnedWriteHalf,
    console: &mut Console,
) -> Result<()> {
    loop {
        select! {
            relay_line = relay_lines.next_line() => {
                if !handle_relay_line(relay_line, console).await? {
                    break;
                }
            }
            input = input_lines.next_line() => {
                if !handle_stdin_input(input, writer, console).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                leave_on_interrupt(ctrl_c, writer, console).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_line(
    line: io::Result<Option<String>>,
    console: &mut Console,
) -> Result<bool> {
    match line.context("failed to read from relay")? {
        Some(line) => {
            console.relayed(&line).await?;
            Ok(true)
        }
        None => {
            console.status("relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
    console: &mut Console,
) -> Result<bool> {
    let Some(line) = input.context("failed to read stdin")? else {
        debug!("stdin closed, leaving");
        return Ok(false);
    };

    write_line(writer, &line)
        .await
        .context("failed to send line")?;

    if ClientLine::parse(line) == ClientLine::Exit {
        console.status("disconnecting").await?;
        return Ok(false);
    }
    Ok(true)
}

/// Ctrl-c leaves the same way typing the exit keyword does.
async fn leave_on_interrupt(
    signal: io::Result<()>,
    writer: &mut OwnedWriteHalf,
    console: &mut Console,
) -> Result<()> {
    if let Err(error) = signal {
        warn!(?error, "ctrl-c handler failed");
    }
    if let Err(error) = write_line(writer, EXIT_KEYWORD).await {
        debug!(%error, "relay gone before exit was sent");
    }
    console.status("disconnecting").await?;
    Ok(())
}

async fn hang_up(writer: &mut OwnedWriteHalf, server: SocketAddr) {
    if let Err(error) = writer.shutdown().await {
        warn!(%server, ?error, "failed to close connection to relay");
    }
}

/// The terminal side of the client. Relay lines are printed verbatim;
/// client status lines carry a `*** ` prefix so they stand apart.
struct Console {
    stdout: Stdout,
}

impl Console {
    fn new() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }

    async fn relayed(&mut self, line: &str) -> io::Result<()> {
        write_line(&mut self.stdout, line).await
    }

    async fn status(&mut self, text: &str) -> io::Result<()> {
        write_line(&mut self.stdout, &format!("*** {text}")).await
    }
}
