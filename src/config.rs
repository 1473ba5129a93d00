use anyhow::{bail, Context as _, Result};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

/// How the SFTP session authenticates. A key file wins over a password.
#[derive(Clone)]
pub enum SftpAuth {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SftpAuth,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub reconnect_delay: Duration,
}

#[derive(Clone)]
pub struct RconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub timeout: Duration,
}

impl fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RconConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub channel_id: u64,
}

impl fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("token", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// Everything the bot needs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub sftp: SftpConfig,
    pub rcon: RconConfig,
    pub discord: DiscordConfig,
    pub poll_interval: Duration,
    /// Consecutive unchanged polls before the server counts as offline
    pub stale_after_polls: u32,
    /// How many recent channel messages the startup cleanup scans
    pub history_limit: u8,
    pub announce_players: bool,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let auth = match (env.optional("SFTP_KEY_PATH"), env.optional("SFTP_PASSWORD")) {
            (Some(key), _) => SftpAuth::KeyFile(PathBuf::from(key)),
            (None, Some(password)) => SftpAuth::Password(password),
            (None, None) => bail!("one of 'SFTP_KEY_PATH' or 'SFTP_PASSWORD' must be set"),
        };

        let sftp = SftpConfig {
            host: env.required("SFTP_HOST")?,
            port: env.parsed("SFTP_PORT", 22)?,
            user: env.required("SFTP_USER")?,
            auth,
            log_path: PathBuf::from(env.required("DEBUG_LOG_PATH")?),
            timeout: Duration::from_secs(env.parsed("SFTP_TIMEOUT_SECS", 10)?),
            reconnect_delay: Duration::from_secs(env.parsed("SFTP_RECONNECT_DELAY_SECS", 15)?),
        };

        let rcon = RconConfig {
            host: env.required("RCON_HOST")?,
            port: env.parsed("RCON_PORT", 25575)?,
            password: env.required("RCON_PASSWORD")?,
            timeout: Duration::from_secs(env.parsed("RCON_TIMEOUT_SECS", 5)?),
        };

        let discord = DiscordConfig {
            token: env.required("DISCORD_TOKEN")?,
            channel_id: env
                .required("DISCORD_CHANNEL_ID")?
                .parse()
                .context("'DISCORD_CHANNEL_ID' is not a valid channel id")?,
        };
        if discord.channel_id == 0 {
            bail!("'DISCORD_CHANNEL_ID' must not be 0");
        }

        let poll_interval = Duration::from_secs(env.parsed("POLL_INTERVAL_SECS", 5)?);
        if poll_interval.is_zero() {
            bail!("'POLL_INTERVAL_SECS' must be at least 1");
        }
        let stale_after_polls: u32 = env.parsed("STALE_AFTER_POLLS", 8)?;
        if stale_after_polls == 0 {
            bail!("'STALE_AFTER_POLLS' must be at least 1");
        }
        let history_limit: u8 = env.parsed("HISTORY_LIMIT", 50)?;
        if !(1..=100).contains(&history_limit) {
            bail!("'HISTORY_LIMIT' must be between 1 and 100");
        }

        Ok(Self {
            sftp,
            rcon,
            discord,
            poll_interval,
            stale_after_polls,
            history_limit,
            announce_players: env.flag("ANNOUNCE_PLAYERS")?,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .with_context(|| format!("'{name}' not found"))
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(name) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("'{name}' has invalid value '{raw}'")),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> Result<bool> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("0" | "false" | "no" | "off") => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some(other) => bail!("'{name}' has invalid value '{other}'"),
        }
    }
}
