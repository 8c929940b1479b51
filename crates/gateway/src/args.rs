//! Command-line surface. The gateway is launched by the IDE, so flags stay
//! minimal: where the control plane lives, who we are, and what we may see.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Serve MCP on stdio (the default for IDE launches).
    Stdio,
    /// Serve MCP over streamable HTTP.
    StreamableHttp,
}

#[derive(Parser, Debug)]
#[command(name = "corral-gateway", version, about)]
pub struct CliArgs {
    /// Control-plane RPC address.
    #[arg(long, default_value = "http://127.0.0.1:8642")]
    pub rpc: String,

    /// Caller name to register as.
    #[arg(long)]
    pub caller: String,

    /// Pin visibility to a single server by name.
    #[arg(conflicts_with = "tags")]
    pub server: Option<String>,

    /// Visibility tag; repeatable. Empty means "all servers".
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// MCP transport toward the IDE.
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    pub transport: TransportKind,

    /// Bind address for the streamable HTTP transport.
    #[arg(long, default_value = "127.0.0.1:8765")]
    pub http_addr: String,

    /// Endpoint path for the streamable HTTP transport.
    #[arg(long, default_value = "/mcp")]
    pub http_endpoint: String,

    /// Give up after this many consecutive failed dials at startup
    /// (0 retries forever).
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Bearer token for the control-plane RPC boundary.
    #[arg(long, env = "CORRAL_TOKEN")]
    pub token: Option<String>,

    /// Extra root CA (PEM) trusted for the control-plane connection.
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    /// Minimum control-plane log level re-emitted as MCP notifications.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_pin_and_tags_are_mutually_exclusive() {
        let err = CliArgs::try_parse_from([
            "corral-gateway",
            "--caller",
            "ide",
            "git",
            "--tag",
            "git",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn tags_repeat() {
        let args = CliArgs::try_parse_from([
            "corral-gateway",
            "--caller",
            "ide",
            "--tag",
            "git",
            "--tag",
            "docker",
        ])
        .unwrap();
        assert_eq!(args.tags, vec!["git".to_string(), "docker".to_string()]);
        assert_eq!(args.server, None);
        assert_eq!(args.transport, TransportKind::Stdio);
    }

    #[test]
    fn positional_server_pin() {
        let args =
            CliArgs::try_parse_from(["corral-gateway", "--caller", "ide", "git-server"]).unwrap();
        assert_eq!(args.server.as_deref(), Some("git-server"));
    }
}
