use std::{net::SocketAddr, time::Duration};

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
    /// Run the relay, accepting TCP connections and fanning out lines.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "LINE_RELAY_LISTEN", default_value = "127.0.0.1:8888")]
    pub listen: SocketAddr,

    /// Drop a peer whose socket does not accept a line within this many milliseconds.
    #[arg(long, env = "LINE_RELAY_WRITE_TIMEOUT_MS")]
    pub write_timeout_ms: Option<u64>,

    /// How long shutdown waits for sessions to finish before aborting them.
    #[arg(long, env = "LINE_RELAY_SHUTDOWN_GRACE_MS", default_value_t = 2000)]
    pub shutdown_grace_ms: u64,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            write_timeout: self.write_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the other participants.
    #[arg(long, env = "LINE_RELAY_NAME")]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, env = "LINE_RELAY_SERVER", default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["line_relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.listen, "127.0.0.1:8888".parse::<SocketAddr>().unwrap());
        assert_eq!(args.relay_config().write_timeout, None);
        assert_eq!(args.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn write_timeout_becomes_duration() {
        let cli = Cli::try_parse_from([
            "line_relay",
            "server",
            "--listen",
            "0.0.0.0:0",
            "--write-timeout-ms",
            "250",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(
            args.relay_config().write_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn client_requires_a_name() {
        assert!(Cli::try_parse_from(["line_relay", "client"]).is_err());
        let cli = Cli::try_parse_from(["line_relay", "client", "--name", "alice"]).expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.name, "alice");
    }
}
