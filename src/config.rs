//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_LOCK_WAIT_SECS: u64 = 30;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug)]
#[command(name = "vfs-gateway", version = VERSION_INFO, about = "Multi-tenant workspace filesystem gateway")]
pub struct Args {
    #[arg(
        short = 'w',
        long,
        env = "VFS_WORKSPACE_BASE",
        default_value = ".vfs/workspaces",
        help = "Directory holding one workspace per tenant"
    )]
    pub workspace_base: String,
    #[arg(
        long,
        env = "VFS_SERVICE_TOKEN",
        hide_env_values = true,
        help = "Bearer token callers must present"
    )]
    pub service_token: String,
    #[arg(
        short = 'b',
        long,
        env = "VFS_BIND",
        default_value = "127.0.0.1",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "VFS_HTTP_PORT",
        default_value_t = 8090,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "VFS_HTTPS_PORT",
        help = "HTTPS port (enables TLS when set)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "VFS_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "VFS_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "VFS_TLS_DIR",
        default_value = ".vfs/tls",
        help = "Directory for the generated self-signed certificate"
    )]
    pub tls_dir: String,
    #[arg(
        long,
        env = "VFS_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_SECS,
        help = "Max seconds to wait for a tenant lock (0 to wait forever)"
    )]
    pub lock_wait_secs: u64,
    #[arg(
        long,
        env = "VFS_MAX_BODY_BYTES",
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes"
    )]
    pub max_body_bytes: usize,
    #[arg(long, env = "VFS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "VFS_LOG",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_only_token_given() {
        let args = Args::try_parse_from(["vfs-gateway", "--service-token", "t0k"]).expect("parse");
        assert_eq!(args.service_token, "t0k");
        assert_eq!(args.http_port, 8090);
        assert_eq!(args.lock_wait_secs, DEFAULT_LOCK_WAIT_SECS);
        assert!(args.https_port.is_none());
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
