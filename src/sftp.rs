use crate::{
    config::{SftpAuth, SftpConfig},
    error::{MonitorError, Result},
    monitor::LogProbe,
    status::LogSnapshot,
};
use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::{
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    sync::Arc,
    time::Instant,
};
use tracing::{info, warn};

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;

fn ssh_error(e: ssh2::Error) -> MonitorError {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => MonitorError::Timeout(e.to_string()),
        ErrorCode::Session(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED,
        )
        | ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => MonitorError::Auth(e.to_string()),
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => MonitorError::NotFound(e.to_string()),
        _ => MonitorError::Connection(e.to_string()),
    }
}

/// An authenticated SSH session and the SFTP subsystem opened on it
struct Link {
    sftp: Sftp,
    // dropped after `sftp`, keeps the transport alive
    _session: Session,
}

fn connect(config: &SftpConfig) -> Result<Link> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MonitorError::Connection(format!("cannot resolve {}", config.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, config.timeout)?;

    let mut session = Session::new().map_err(ssh_error)?;
    session.set_timeout(config.timeout.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_error)?;
    match &config.auth {
        SftpAuth::KeyFile(key) => session.userauth_pubkey_file(&config.user, None, key, None),
        SftpAuth::Password(password) => session.userauth_password(&config.user, password),
    }
    .map_err(|e| MonitorError::Auth(e.to_string()))?;
    if !session.authenticated() {
        return Err(MonitorError::Auth(format!(
            "server did not accept credentials for {}",
            config.user
        )));
    }
    let sftp = session.sftp().map_err(ssh_error)?;
    Ok(Link {
        sftp,
        _session: session,
    })
}

/// Only the file attributes are fetched, never its contents
fn stat_log(sftp: &Sftp, path: &Path) -> Result<LogSnapshot> {
    snapshot(sftp.stat(path))
}

fn snapshot(stat: std::result::Result<FileStat, ssh2::Error>) -> Result<LogSnapshot> {
    match stat.map_err(ssh_error) {
        Ok(stat) => Ok(LogSnapshot {
            exists: true,
            size: stat.size.unwrap_or(0),
            mtime: stat.mtime.unwrap_or(0),
        }),
        Err(MonitorError::NotFound(_)) => Ok(LogSnapshot::missing()),
        Err(e) => Err(e),
    }
}

/// Watches the server's debug log over SFTP, holding one SSH session and
/// its SFTP channel open between polls.
pub struct SftpProbe {
    config: Arc<SftpConfig>,
    link: Option<Link>,
    /// Set after a failed connect; further attempts wait out the reconnect delay
    last_failed_connect: Option<Instant>,
}

impl SftpProbe {
    pub fn new(config: SftpConfig) -> Self {
        Self {
            config: Arc::new(config),
            link: None,
            last_failed_connect: None,
        }
    }

    async fn link(&mut self) -> Result<Link> {
        if let Some(link) = self.link.take() {
            return Ok(link);
        }
        if let Some(at) = self.last_failed_connect {
            let waited = at.elapsed();
            if waited < self.config.reconnect_delay {
                let left = self.config.reconnect_delay - waited;
                info!("Reconnect throttled, waiting {}s more", left.as_secs());
                return Err(MonitorError::Connection(format!(
                    "reconnect throttled for another {}s",
                    left.as_secs()
                )));
            }
        }

        let config = self.config.clone();
        let connected = tokio::task::spawn_blocking(move || connect(&config))
            .await
            .map_err(|e| MonitorError::Connection(e.to_string()))?;
        match connected {
            Ok(link) => {
                info!(
                    "SFTP connected to {}:{}",
                    self.config.host, self.config.port
                );
                self.last_failed_connect = None;
                Ok(link)
            }
            Err(e) => {
                self.last_failed_connect = Some(Instant::now());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl LogProbe for SftpProbe {
    async fn probe(&mut self) -> Result<LogSnapshot> {
        let link = self.link().await?;
        let config = self.config.clone();
        let (link, snapshot) = tokio::task::spawn_blocking(move || {
            let snapshot = stat_log(&link.sftp, &config.log_path);
            (link, snapshot)
        })
        .await
        .map_err(|e| MonitorError::Connection(e.to_string()))?;

        match snapshot {
            Ok(snapshot) => {
                self.link = Some(link);
                Ok(snapshot)
            }
            Err(e) => {
                warn!("SFTP error, dropping session: {e}");
                Err(e)
            }
        }
    }
}
