//! HTTPS 证书：使用配置的 PEM 文件，或在证书目录中生成并复用自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::Args;

const SELF_SIGNED_CERT: &str = "self-signed-cert.pem";
const SELF_SIGNED_KEY: &str = "self-signed-key.pem";

#[derive(Debug, PartialEq, Eq)]
enum CertSource {
    Files { cert: PathBuf, key: PathBuf },
    SelfSigned { dir: PathBuf },
}

impl CertSource {
    /// 证书与私钥必须成对配置，只给出其一视为配置错误。
    fn from_args(args: &Args) -> io::Result<Self> {
        match (&args.tls_cert, &args.tls_key) {
            (Some(cert), Some(key)) => Ok(CertSource::Files {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            (None, None) => Ok(CertSource::SelfSigned {
                dir: PathBuf::from(&args.tls_dir),
            }),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "--tls-cert and --tls-key must be given together",
            )),
        }
    }
}

pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match CertSource::from_args(args)? {
        CertSource::Files { cert, key } => (cert, key),
        CertSource::SelfSigned { dir } => ensure_self_signed(&dir, host).await?,
    };
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// 目录中已有自签名证书时直接复用，避免每次重启都让客户端重新信任。
async fn ensure_self_signed(dir: &Path, host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let cert_path = dir.join(SELF_SIGNED_CERT);
    let key_path = dir.join(SELF_SIGNED_KEY);
    if fs::try_exists(&cert_path).await? && fs::try_exists(&key_path).await? {
        info!(cert = %cert_path.display(), "reusing self-signed certificate");
        return Ok((cert_path, key_path));
    }

    let cert = generate_simple_self_signed(subject_alt_names(host))
        .map_err(|err| io::Error::other(err.to_string()))?;
    fs::create_dir_all(dir).await?;
    fs::write(&cert_path, cert.cert.pem()).await?;
    fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    restrict_key_permissions(&key_path).await?;
    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok((cert_path, key_path))
}

/// 监听在通配地址时用回环地址代替，通配地址不能作为证书名称。
fn subject_alt_names(host: IpAddr) -> Vec<String> {
    let ip = if host.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host
    };
    vec!["localhost".to_string(), ip.to_string()]
}

#[cfg(unix)]
async fn restrict_key_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_key_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["vfs-gateway", "--service-token", "t0k"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn half_configured_pair_is_rejected() {
        for extra in [["--tls-cert", "cert.pem"], ["--tls-key", "key.pem"]] {
            let err = CertSource::from_args(&parse(&extra)).expect_err("half pair accepted");
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn cert_source_follows_configuration() {
        let files = parse(&["--tls-cert", "c.pem", "--tls-key", "k.pem"]);
        assert_eq!(
            CertSource::from_args(&files).expect("files"),
            CertSource::Files {
                cert: PathBuf::from("c.pem"),
                key: PathBuf::from("k.pem"),
            }
        );
        let generated = parse(&["--tls-dir", "/var/lib/vfs/tls"]);
        assert_eq!(
            CertSource::from_args(&generated).expect("self-signed"),
            CertSource::SelfSigned {
                dir: PathBuf::from("/var/lib/vfs/tls"),
            }
        );
    }

    #[test]
    fn wildcard_bind_is_named_as_loopback() {
        let names = subject_alt_names("0.0.0.0".parse().expect("ip"));
        assert_eq!(names, ["localhost", "127.0.0.1"]);
        let names = subject_alt_names("192.168.1.20".parse().expect("ip"));
        assert_eq!(names, ["localhost", "192.168.1.20"]);
    }

    #[tokio::test]
    async fn self_signed_cert_is_generated_once_and_reused() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("tls");
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let (cert, key) = ensure_self_signed(&dir, host).await.expect("generate");
        let first = std::fs::read(&cert).expect("read cert");
        assert!(String::from_utf8_lossy(&first).contains("BEGIN CERTIFICATE"));
        assert!(key.exists());

        let (again, _) = ensure_self_signed(&dir, host).await.expect("reuse");
        assert_eq!(again, cert);
        assert_eq!(std::fs::read(&again).expect("read cert"), first);
    }
}
