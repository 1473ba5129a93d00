use crate::{
    error::{self, MonitorError},
    monitor::{PriorMessage, StatusChannel},
    status::{ServerState, StatusReport},
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use itertools::Itertools;
use poise::serenity_prelude::{
    self as serenity, ChannelId, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage,
    GetMessages, Http, MessageId, UserId,
};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::watch;
use tracing::info;

/// Discord caps embed field values at this many characters
const FIELD_LIMIT: usize = 1024;

pub struct Data {
    reports: watch::Receiver<StatusReport>,
    poll_interval: Duration,
}

impl Data {
    pub fn new(reports: watch::Receiver<StatusReport>, poll_interval: Duration) -> Self {
        Self {
            reports,
            poll_interval,
        }
    }
}

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

pub async fn create_client(discord_token: &str, data: Data) -> Result<serenity::Client> {
    let intents = serenity::GatewayIntents::non_privileged();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![status()],
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();
    let client = serenity::ClientBuilder::new(discord_token, intents)
        .framework(framework)
        .await?;
    Ok(client)
}

/// Gets the status of the minecraft server
#[poise::command(prefix_command, slash_command)]
async fn status(ctx: Context<'_>) -> Result<(), Error> {
    info!("status command called by {}", ctx.author().name);
    let report = ctx.data().reports.borrow().clone();
    let embed = status_embed(&report, ctx.data().poll_interval);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Heading and value of the player field
fn players_field(report: &StatusReport) -> (String, String) {
    let heading = match report.max_players {
        Some(max) => format!("👥 Players online ({}/{max})", report.player_count()),
        None => format!("👥 Players online ({})", report.player_count()),
    };
    if report.players.is_empty() {
        return (heading, "-".to_string());
    }
    let names = report.players.iter().join(", ");
    if names.chars().count() <= FIELD_LIMIT {
        return (heading, names);
    }
    let mut shown = String::new();
    for (i, name) in report.players.iter().enumerate() {
        let more = format!(" and {} more", report.players.len() - i);
        if shown.chars().count() + name.chars().count() + 2 + more.chars().count() > FIELD_LIMIT {
            shown.push_str(&more);
            break;
        }
        if !shown.is_empty() {
            shown.push_str(", ");
        }
        shown.push_str(name);
    }
    (heading, shown)
}

pub fn status_embed(report: &StatusReport, poll_interval: Duration) -> CreateEmbed {
    let (heading, names) = players_field(report);
    let mut embed = CreateEmbed::new()
        .title(report.title())
        .colour(report.state.colour())
        .field(heading, names, false)
        .footer(CreateEmbedFooter::new(format!(
            "🕐 Status updates every {} seconds",
            poll_interval.as_secs()
        )));
    if report.state == ServerState::Starting {
        embed = embed.description("⚠️ *If it crashes just start it again*");
    }
    let checked = report
        .checked_at
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| serenity::Timestamp::from_unix_timestamp(d.as_secs() as i64).ok());
    if let Some(checked) = checked {
        embed = embed.timestamp(checked);
    }
    embed
}

fn http_status(e: &serenity::Error) -> Option<u16> {
    match e {
        serenity::Error::Http(http) => http.status_code().map(|code| code.as_u16()),
        _ => None,
    }
}

fn presentation_error(e: serenity::Error) -> MonitorError {
    match http_status(&e) {
        Some(401 | 403) => MonitorError::Auth(e.to_string()),
        _ => MonitorError::Presentation(e.to_string()),
    }
}

/// Like [`presentation_error`], but a 404 means the message was removed
fn message_error(e: serenity::Error) -> MonitorError {
    match http_status(&e) {
        Some(404) => MonitorError::MessageGone,
        _ => presentation_error(e),
    }
}

/// The status channel, driven through Discord's REST API
pub struct DiscordChannel {
    http: Arc<Http>,
    channel_id: ChannelId,
    bot_id: UserId,
    poll_interval: Duration,
}

impl DiscordChannel {
    /// Looks up the bot's own user so its earlier messages can be recognised.
    pub async fn connect(http: Arc<Http>, channel_id: u64, poll_interval: Duration) -> Result<Self> {
        let bot = http
            .get_current_user()
            .await
            .context("Failed to look up the bot user")?;
        info!("Logged in as {} (id: {})", bot.name, bot.id);
        Ok(Self {
            http,
            channel_id: ChannelId::new(channel_id),
            bot_id: bot.id,
            poll_interval,
        })
    }
}

#[async_trait]
impl StatusChannel for DiscordChannel {
    async fn recent_messages(&self, limit: u8) -> error::Result<Vec<PriorMessage>> {
        let messages = self
            .channel_id
            .messages(&*self.http, GetMessages::new().limit(limit))
            .await
            .map_err(presentation_error)?;
        Ok(messages
            .into_iter()
            .map(|m| PriorMessage {
                id: m.id,
                own: m.author.id == self.bot_id,
                title: m.embeds.first().and_then(|e| e.title.clone()),
            })
            .collect())
    }

    async fn delete_message(&self, id: MessageId) -> error::Result<()> {
        self.channel_id
            .delete_message(&*self.http, id)
            .await
            .map_err(message_error)
    }

    async fn send_status(&self, report: &StatusReport) -> error::Result<MessageId> {
        let message = self
            .channel_id
            .send_message(
                &*self.http,
                CreateMessage::new().embed(status_embed(report, self.poll_interval)),
            )
            .await
            .map_err(presentation_error)?;
        Ok(message.id)
    }

    async fn edit_status(&self, id: MessageId, report: &StatusReport) -> error::Result<()> {
        self.channel_id
            .edit_message(
                &*self.http,
                id,
                EditMessage::new().embed(status_embed(report, self.poll_interval)),
            )
            .await
            .map_err(message_error)?;
        Ok(())
    }

    async fn announce(&self, text: &str) -> error::Result<()> {
        self.channel_id
            .say(&*self.http, text)
            .await
            .map_err(presentation_error)?;
        Ok(())
    }
}
