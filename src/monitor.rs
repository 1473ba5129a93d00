use crate::{
    config::Config,
    error::{MonitorError, Result},
    rcon::PlayerList,
    status::{Classifier, LogSnapshot, MonitorState, QueryOutcome, ServerState, StatusReport},
};
use async_trait::async_trait;
use poise::serenity_prelude::MessageId;
use std::{cmp::Reverse, time::Duration};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Reads the remote log file's attributes
#[async_trait]
pub trait LogProbe: Send {
    async fn probe(&mut self) -> Result<LogSnapshot>;
}

/// Asks the game server who is online
#[async_trait]
pub trait PlayerQuery: Send + Sync {
    async fn query_players(&self) -> Result<PlayerList>;
}

/// A message found in the channel's recent history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorMessage {
    pub id: MessageId,
    /// Written by this bot
    pub own: bool,
    /// Title of the first embed, if any
    pub title: Option<String>,
}

impl PriorMessage {
    pub fn is_status(&self) -> bool {
        self.own
            && self.title.as_deref().is_some_and(|title| {
                ServerState::ALL
                    .iter()
                    .any(|state| title.starts_with(state.marker()))
            })
    }
}

/// The chat channel that shows the status message
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn recent_messages(&self, limit: u8) -> Result<Vec<PriorMessage>>;
    async fn delete_message(&self, id: MessageId) -> Result<()>;
    async fn send_status(&self, report: &StatusReport) -> Result<MessageId>;
    async fn edit_status(&self, id: MessageId, report: &StatusReport) -> Result<()>;
    async fn announce(&self, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub stale_after_polls: u32,
    pub history_limit: u8,
    pub announce_players: bool,
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            stale_after_polls: config.stale_after_polls,
            history_limit: config.history_limit,
            announce_players: config.announce_players,
        }
    }
}

pub struct Monitor<P, Q, C> {
    probe: P,
    query: Q,
    channel: C,
    classifier: Classifier,
    settings: MonitorSettings,
    state: MonitorState,
    reports: watch::Sender<StatusReport>,
}

impl<P, Q, C> Monitor<P, Q, C>
where
    P: LogProbe,
    Q: PlayerQuery,
    C: StatusChannel,
{
    pub fn new(
        probe: P,
        query: Q,
        channel: C,
        settings: MonitorSettings,
        reports: watch::Sender<StatusReport>,
    ) -> Self {
        Self {
            probe,
            query,
            channel,
            classifier: Classifier::new(settings.stale_after_polls),
            settings,
            state: MonitorState::default(),
            reports,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Removes status messages left behind by earlier runs.
    ///
    /// The newest one survives and becomes the tracked message. Returns how
    /// many were deleted.
    pub async fn cleanup(&mut self) -> Result<usize> {
        info!("Scanning channel for old status messages");
        let mut old = self
            .channel
            .recent_messages(self.settings.history_limit)
            .await?
            .into_iter()
            .filter(PriorMessage::is_status)
            .collect::<Vec<_>>();
        old.sort_by_key(|m| Reverse(m.id.get()));

        let mut old = old.into_iter();
        let survivor = old.next();
        let mut deleted = 0;
        for message in old {
            match self.channel.delete_message(message.id).await {
                Ok(()) => {
                    info!("Deleted old status message {}", message.id);
                    deleted += 1;
                }
                Err(MonitorError::MessageGone) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(survivor) = &survivor {
            info!("Reusing status message {}", survivor.id);
        }
        self.state.message = survivor.map(|m| m.id);
        Ok(deleted)
    }

    /// One probe, query, classify, present pass
    pub async fn run_cycle(&mut self) -> StatusReport {
        let snapshot = match self.probe.probe().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Log probe failed: {e}");
                None
            }
        };
        let previous = self.state.state;
        let activity = self.state.tracker.observe(snapshot);

        let (outcome, players) = if self.classifier.needs_query(previous, activity) {
            match self.query.query_players().await {
                Ok(list) => (QueryOutcome::Answered, Some(list)),
                Err(e) => {
                    warn!("Player query failed: {e}");
                    (QueryOutcome::Failed, None)
                }
            }
        } else {
            (QueryOutcome::NotRun, None)
        };

        let state = self.classifier.classify(previous, activity, outcome);
        debug!(
            "log {:?} ({activity:?}), query {outcome:?}, state {previous} -> {state}",
            self.state.tracker.last()
        );
        if state != previous {
            info!("Server {previous} -> {state}");
        }

        let mut report = StatusReport::new(state, players.as_ref());
        if state == ServerState::Online && players.is_none() {
            // held ONLINE through a missed query, keep showing the last list
            let last = self.reports.borrow();
            report.players = last.players.clone();
            report.max_players = last.max_players;
        }
        self.track_players(&report).await;
        self.state.state = state;
        self.present(&report).await;
        self.reports.send_replace(report.clone());
        report
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Monitor loop started");
        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            debug!("{report}");
        }
    }

    /// Who joined or left since the last known list. While STARTING the list
    /// is unknown and kept as it was. Joins are only announced while the
    /// server was already ONLINE, so players found on the first ONLINE cycle
    /// are recorded silently.
    async fn track_players(&mut self, report: &StatusReport) {
        if report.state == ServerState::Starting {
            return;
        }
        let was_online = self.state.state == ServerState::Online;
        let previous = std::mem::replace(&mut self.state.players, report.players.clone());
        if !self.settings.announce_players {
            return;
        }
        let joined = report
            .players
            .iter()
            .filter(|n| was_online && !previous.contains(n));
        for name in joined {
            info!("Player joined: {name}");
            announce(&self.channel, &format!("🟢  **{name}** joined the server")).await;
        }
        for name in previous.iter().filter(|n| !report.players.contains(n)) {
            info!("Player left: {name}");
            announce(&self.channel, &format!("🔴  **{name}** left the server")).await;
        }
    }

    async fn present(&mut self, report: &StatusReport) {
        if let Some(id) = self.state.message {
            match self.channel.edit_status(id, report).await {
                Ok(()) => return,
                Err(MonitorError::MessageGone) => {
                    warn!("Status message {id} disappeared, posting a new one");
                    self.state.message = None;
                }
                Err(e) => {
                    error!("Failed to update status message: {e}");
                    return;
                }
            }
        }
        match self.channel.send_status(report).await {
            Ok(id) => {
                info!("Posted status message {id}");
                self.state.message = Some(id);
            }
            Err(e) => error!("Failed to post status message: {e}"),
        }
    }
}

async fn announce<C: StatusChannel>(channel: &C, text: &str) {
    if let Err(e) = channel.announce(text).await {
        error!("Failed to announce player change: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    struct ScriptedProbe(VecDeque<Result<LogSnapshot>>);

    #[async_trait]
    impl LogProbe for ScriptedProbe {
        async fn probe(&mut self) -> Result<LogSnapshot> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(MonitorError::Connection("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct ScriptedQuery {
        replies: Mutex<VecDeque<Result<PlayerList>>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl PlayerQuery for ScriptedQuery {
        async fn query_players(&self) -> Result<PlayerList> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(MonitorError::Timeout("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct ChannelLog {
        messages: Vec<PriorMessage>,
        next_id: u64,
        sends: usize,
        edits: usize,
        announcements: Vec<String>,
        fail_edits: bool,
    }

    #[derive(Clone, Default)]
    struct FakeChannel(Arc<Mutex<ChannelLog>>);

    impl FakeChannel {
        fn with_history(messages: Vec<PriorMessage>) -> Self {
            let next_id = messages.iter().map(|m| m.id.get()).max().unwrap_or(0);
            Self(Arc::new(Mutex::new(ChannelLog {
                messages,
                next_id,
                ..Default::default()
            })))
        }

        fn status_count(&self) -> usize {
            let log = self.0.lock().unwrap();
            log.messages.iter().filter(|m| m.is_status()).count()
        }

        fn remove(&self, id: MessageId) {
            self.0.lock().unwrap().messages.retain(|m| m.id != id);
        }
    }

    #[async_trait]
    impl StatusChannel for FakeChannel {
        async fn recent_messages(&self, limit: u8) -> Result<Vec<PriorMessage>> {
            let log = self.0.lock().unwrap();
            Ok(log
                .messages
                .iter()
                .rev()
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn delete_message(&self, id: MessageId) -> Result<()> {
            self.remove(id);
            Ok(())
        }

        async fn send_status(&self, report: &StatusReport) -> Result<MessageId> {
            let mut log = self.0.lock().unwrap();
            log.next_id += 1;
            let id = MessageId::new(log.next_id);
            log.sends += 1;
            log.messages.push(PriorMessage {
                id,
                own: true,
                title: Some(report.title()),
            });
            Ok(id)
        }

        async fn edit_status(&self, id: MessageId, report: &StatusReport) -> Result<()> {
            let mut log = self.0.lock().unwrap();
            if log.fail_edits {
                return Err(MonitorError::Presentation("discord is down".into()));
            }
            let message = log
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(MonitorError::MessageGone)?;
            message.title = Some(report.title());
            log.edits += 1;
            Ok(())
        }

        async fn announce(&self, text: &str) -> Result<()> {
            self.0.lock().unwrap().announcements.push(text.to_string());
            Ok(())
        }
    }

    fn snap(size: u64) -> Result<LogSnapshot> {
        Ok(LogSnapshot {
            exists: true,
            size,
            mtime: 1_700_000_000 + size,
        })
    }

    fn players(names: &[&str]) -> Result<PlayerList> {
        Ok(PlayerList {
            names: names.iter().map(|n| n.to_string()).collect(),
            max: Some(20),
        })
    }

    fn settings(stale_after_polls: u32, announce_players: bool) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(10),
            stale_after_polls,
            history_limit: 50,
            announce_players,
        }
    }

    fn monitor(
        probes: Vec<Result<LogSnapshot>>,
        replies: Vec<Result<PlayerList>>,
        channel: FakeChannel,
        settings: MonitorSettings,
    ) -> Monitor<ScriptedProbe, ScriptedQuery, FakeChannel> {
        let query = ScriptedQuery {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        };
        let (reports, _) = watch::channel(StatusReport::default());
        Monitor::new(ScriptedProbe(probes.into()), query, channel, settings, reports)
    }

    fn watched(
        monitor: &Monitor<ScriptedProbe, ScriptedQuery, FakeChannel>,
    ) -> watch::Receiver<StatusReport> {
        monitor.reports.subscribe()
    }

    fn own_status(id: u64, state: ServerState) -> PriorMessage {
        PriorMessage {
            id: MessageId::new(id),
            own: true,
            title: Some(StatusReport::new(state, None).title()),
        }
    }

    #[tokio::test]
    async fn cleanup_leaves_one_status_message() {
        let channel = FakeChannel::with_history(vec![
            own_status(10, ServerState::Online),
            PriorMessage {
                id: MessageId::new(11),
                own: false,
                title: Some("🟢  Server is ONLINE".into()),
            },
            own_status(12, ServerState::Starting),
            PriorMessage {
                id: MessageId::new(13),
                own: true,
                title: None,
            },
            own_status(14, ServerState::Offline),
        ]);
        let mut monitor = monitor(vec![], vec![], channel.clone(), settings(2, false));

        let deleted = monitor.cleanup().await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(channel.status_count(), 1);
        assert_eq!(monitor.state().message, Some(MessageId::new(14)));
        // foreign and non-status messages are left alone
        assert_eq!(channel.0.lock().unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn presenting_twice_edits_in_place() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(1)],
            vec![],
            channel.clone(),
            settings(5, false),
        );
        monitor.cleanup().await.unwrap();

        let first = monitor.run_cycle().await;
        let second = monitor.run_cycle().await;

        assert_eq!(first.state, second.state);
        let log = channel.0.lock().unwrap();
        assert_eq!(log.sends, 1);
        assert_eq!(log.edits, 1);
        assert_eq!(log.messages.len(), 1);
    }

    #[tokio::test]
    async fn walks_through_startup_and_shutdown() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2), snap(3), snap(3), snap(3)],
            vec![
                Err(MonitorError::Connection("refused".into())),
                players(&["Alex", "Steve"]),
            ],
            channel.clone(),
            settings(2, false),
        );
        let updates = watched(&monitor);

        assert_eq!(monitor.run_cycle().await.state, ServerState::Offline);
        assert_eq!(monitor.run_cycle().await.state, ServerState::Starting);
        let online = monitor.run_cycle().await;
        assert_eq!(online.state, ServerState::Online);
        assert_eq!(online.player_count(), 2);
        assert_eq!(updates.borrow().player_count(), 2);
        // first idle poll is within grace; the query script is exhausted but
        // the server stays ONLINE with the last known players
        let held = monitor.run_cycle().await;
        assert_eq!(held.state, ServerState::Online);
        assert_eq!(held.players, vec!["Alex", "Steve"]);
        assert_eq!(monitor.run_cycle().await.state, ServerState::Offline);
        assert_eq!(updates.borrow().state, ServerState::Offline);
        assert_eq!(channel.status_count(), 1);
    }

    #[tokio::test]
    async fn idle_offline_server_is_not_queried() {
        let mut monitor = monitor(
            vec![snap(1), snap(1), snap(1)],
            vec![players(&["Alex"])],
            FakeChannel::default(),
            settings(5, false),
        );
        for _ in 0..3 {
            assert_eq!(monitor.run_cycle().await.state, ServerState::Offline);
        }
        assert_eq!(*monitor.query.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn probe_failure_means_offline() {
        let mut monitor = monitor(
            vec![snap(1), snap(2), Err(MonitorError::Auth("denied".into()))],
            vec![players(&[])],
            FakeChannel::default(),
            settings(5, false),
        );
        monitor.run_cycle().await;
        assert_eq!(monitor.run_cycle().await.state, ServerState::Online);
        assert_eq!(monitor.run_cycle().await.state, ServerState::Offline);
    }

    #[tokio::test]
    async fn deleted_status_message_is_replaced() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(1)],
            vec![],
            channel.clone(),
            settings(5, false),
        );
        monitor.run_cycle().await;
        let first = monitor.state().message.unwrap();
        channel.remove(first);

        monitor.run_cycle().await;

        let second = monitor.state().message.unwrap();
        assert_ne!(first, second);
        assert_eq!(channel.status_count(), 1);
    }

    #[tokio::test]
    async fn presentation_failure_does_not_stop_the_cycle() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2)],
            vec![players(&["Alex"])],
            channel.clone(),
            settings(5, false),
        );
        monitor.run_cycle().await;
        channel.0.lock().unwrap().fail_edits = true;

        let report = monitor.run_cycle().await;

        assert_eq!(report.state, ServerState::Online);
        assert_eq!(monitor.state().state, ServerState::Online);
        assert!(monitor.state().message.is_some());
        assert_eq!(channel.0.lock().unwrap().sends, 1);
    }

    #[tokio::test]
    async fn announces_joins_and_leaves() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2), snap(3), Ok(LogSnapshot::missing())],
            vec![players(&["Alex"]), players(&["Alex", "Steve"])],
            channel.clone(),
            settings(5, true),
        );
        for _ in 0..4 {
            monitor.run_cycle().await;
        }
        let log = channel.0.lock().unwrap();
        assert_eq!(
            log.announcements,
            vec![
                "🟢  **Steve** joined the server",
                "🔴  **Alex** left the server",
                "🔴  **Steve** left the server",
            ]
        );
    }

    #[tokio::test]
    async fn first_online_cycle_announces_nobody() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2)],
            vec![players(&["Alex", "Steve", "Herobrine"])],
            channel.clone(),
            settings(5, true),
        );
        monitor.run_cycle().await;
        assert_eq!(monitor.run_cycle().await.state, ServerState::Online);
        assert!(channel.0.lock().unwrap().announcements.is_empty());
        assert_eq!(monitor.state().players, vec!["Alex", "Steve", "Herobrine"]);
    }

    #[tokio::test]
    async fn missed_query_on_quiet_log_keeps_online() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2), snap(2)],
            vec![
                players(&["Alex"]),
                Err(MonitorError::Timeout("rcon read".into())),
            ],
            channel.clone(),
            settings(5, true),
        );
        monitor.run_cycle().await;
        monitor.run_cycle().await;

        let report = monitor.run_cycle().await;

        assert_eq!(report.state, ServerState::Online);
        assert_eq!(report.players, vec!["Alex"]);
        assert_eq!(report.max_players, Some(20));
        assert!(channel.0.lock().unwrap().announcements.is_empty());
    }

    #[tokio::test]
    async fn announcements_are_off_by_default() {
        let channel = FakeChannel::default();
        let mut monitor = monitor(
            vec![snap(1), snap(2)],
            vec![players(&["Alex"])],
            channel.clone(),
            settings(5, false),
        );
        monitor.run_cycle().await;
        monitor.run_cycle().await;
        assert!(channel.0.lock().unwrap().announcements.is_empty());
        assert_eq!(monitor.state().players, vec!["Alex"]);
    }
}
