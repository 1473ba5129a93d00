use crate::rcon::PlayerList;
use poise::serenity_prelude::MessageId;
use std::{fmt, time::SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Offline,
    Starting,
    Online,
}

impl ServerState {
    pub const ALL: [ServerState; 3] = [Self::Offline, Self::Starting, Self::Online];

    /// Leading marker of a status message title, also used to recognise our own messages
    pub fn marker(self) -> &'static str {
        match self {
            Self::Offline => "🔴",
            Self::Starting => "🟡",
            Self::Online => "🟢",
        }
    }

    pub fn colour(self) -> u32 {
        match self {
            Self::Offline => 0xE74C3C,
            Self::Starting => 0xF39C12,
            Self::Online => 0x2ECC71,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "OFFLINE",
            Self::Starting => "STARTING",
            Self::Online => "ONLINE",
        })
    }
}

/// Attributes of the remote log file at one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    pub exists: bool,
    pub size: u64,
    /// Seconds since the unix epoch, as reported by the remote host
    pub mtime: u64,
}

impl LogSnapshot {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: 0,
            mtime: 0,
        }
    }
}

/// What the log file did between the previous poll and this one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogActivity {
    /// Missing file, or the probe could not reach it
    Absent,
    Changed,
    /// Unchanged for this many consecutive polls
    Idle(u32),
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    last: Option<LogSnapshot>,
    unchanged: u32,
}

impl ActivityTracker {
    /// Feeds one probe result in. `None` means the probe failed.
    ///
    /// The first snapshot after startup (or after the file vanished) only sets
    /// the baseline; it never counts as a change.
    pub fn observe(&mut self, snapshot: Option<LogSnapshot>) -> LogActivity {
        let snapshot = match snapshot {
            Some(s) if s.exists => s,
            _ => {
                self.last = None;
                self.unchanged = 0;
                return LogActivity::Absent;
            }
        };
        let activity = match self.last {
            Some(prev) if prev.size != snapshot.size || prev.mtime != snapshot.mtime => {
                self.unchanged = 0;
                LogActivity::Changed
            }
            Some(_) => {
                self.unchanged = self.unchanged.saturating_add(1);
                LogActivity::Idle(self.unchanged)
            }
            None => {
                self.unchanged = 0;
                LogActivity::Idle(0)
            }
        };
        self.last = Some(snapshot);
        activity
    }

    pub fn last(&self) -> Option<LogSnapshot> {
        self.last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    NotRun,
    Failed,
    Answered,
}

/// Decides the server state from log activity and the RCON result.
///
/// OFFLINE only leaves for STARTING or ONLINE on a detected log change.
/// Any state drops to OFFLINE once the log is absent or idle for
/// `stale_after_polls` consecutive polls.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    pub stale_after_polls: u32,
}

impl Classifier {
    pub fn new(stale_after_polls: u32) -> Self {
        Self {
            stale_after_polls: stale_after_polls.max(1),
        }
    }

    fn is_stale(&self, activity: LogActivity) -> bool {
        match activity {
            LogActivity::Absent => true,
            LogActivity::Changed => false,
            LogActivity::Idle(n) => n >= self.stale_after_polls,
        }
    }

    /// Whether this cycle should ask the server for its player list
    pub fn needs_query(&self, previous: ServerState, activity: LogActivity) -> bool {
        match activity {
            LogActivity::Changed => true,
            _ if self.is_stale(activity) => false,
            _ => previous != ServerState::Offline,
        }
    }

    pub fn classify(
        &self,
        previous: ServerState,
        activity: LogActivity,
        query: QueryOutcome,
    ) -> ServerState {
        if self.is_stale(activity) {
            return ServerState::Offline;
        }
        let changed = activity == LogActivity::Changed;
        match (previous, query) {
            (ServerState::Offline, _) if !changed => ServerState::Offline,
            (_, QueryOutcome::Answered) => ServerState::Online,
            // a missed query on a quiet log does not demote a running server
            (ServerState::Online, _) if !changed => ServerState::Online,
            _ => ServerState::Starting,
        }
    }
}

/// One cycle's result, as shown in the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: ServerState,
    pub players: Vec<String>,
    pub max_players: Option<usize>,
    pub checked_at: SystemTime,
}

impl StatusReport {
    pub fn new(state: ServerState, players: Option<&PlayerList>) -> Self {
        Self {
            state,
            players: players.map(|p| p.names.clone()).unwrap_or_default(),
            max_players: players.and_then(|p| p.max),
            checked_at: SystemTime::now(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn title(&self) -> String {
        match self.state {
            ServerState::Starting => format!("{}  Server is STARTING UP...", self.state.marker()),
            state => format!("{}  Server is {state}", state.marker()),
        }
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::new(ServerState::Offline, None)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} players online)", self.state, self.player_count())
    }
}

/// Everything carried from one poll cycle to the next
#[derive(Debug, Default)]
pub struct MonitorState {
    pub state: ServerState,
    pub tracker: ActivityTracker,
    pub players: Vec<String>,
    pub message: Option<MessageId>,
}
