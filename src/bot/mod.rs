//! # Bot Module
//!
//! Front ends for the playback manager: a line console for the binary and
//! a blocking facade for callers that do not run on the async runtime.

pub mod blocking;

use anyhow::{anyhow, bail, Result};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use crate::{
    audio::{
        parse_timestamp,
        player::{PlaybackEvent, PlaybackManager, PlayerState, SessionStatus},
        queue::LoopMode,
    },
    voice::Destination,
};

pub use blocking::BlockingClient;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Join(Destination),
    Leave(Destination),
    Play(Destination, String),
    Random(Destination, usize),
    Skip(Destination),
    Pause(Destination),
    Resume(Destination),
    Stop(Destination),
    Seek(Destination, Duration),
    Rewind(Destination, Duration),
    Forward(Destination, Duration),
    Loop(Destination, LoopMode),
    /// Percent, 0-200.
    Volume(Destination, u32),
    Status(Destination),
    Sessions,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or_else(|| anyhow!("empty command"))?.to_lowercase();

        if matches!(name.as_str(), "help" | "?") {
            return Ok(Self::Help);
        }
        if matches!(name.as_str(), "quit" | "exit") {
            return Ok(Self::Quit);
        }
        if name == "sessions" {
            return Ok(Self::Sessions);
        }

        let dest = words
            .next()
            .ok_or_else(|| anyhow!("`{}` needs a destination id", name))?
            .parse::<u64>()
            .map(Destination)
            .map_err(|_| anyhow!("destination must be a number"))?;
        let rest = words.collect::<Vec<_>>().join(" ");

        let command = match name.as_str() {
            "join" => Self::Join(dest),
            "leave" | "disconnect" => Self::Leave(dest),
            "play" | "p" => {
                if rest.is_empty() {
                    bail!("Usage: play <destination> <url or search>");
                }
                Self::Play(dest, rest)
            }
            "random" | "randomsong" => {
                let rolls = if rest.is_empty() { 1 } else { rest.parse()? };
                Self::Random(dest, rolls)
            }
            "skip" | "s" => Self::Skip(dest),
            "pause" => Self::Pause(dest),
            "resume" => Self::Resume(dest),
            "stop" => Self::Stop(dest),
            "seek" => Self::Seek(dest, parse_timestamp(&rest)?),
            "rewind" => Self::Rewind(dest, parse_timestamp(&rest)?),
            "forward" => Self::Forward(dest, parse_timestamp(&rest)?),
            "loop" => Self::Loop(dest, rest.parse().map_err(|e: String| anyhow!(e))?),
            "volume" | "vol" => {
                let percent: u32 = rest.parse().map_err(|_| anyhow!("volume must be 0-200"))?;
                if percent > 200 {
                    bail!("volume must be 0-200");
                }
                Self::Volume(dest, percent)
            }
            "status" | "np" | "queue" => Self::Status(dest),
            other => bail!("Unknown command `{}` (try `help`)", other),
        };
        Ok(command)
    }
}

pub const HELP: &str = "\
join <d>              connect to destination <d>
play <d> <ref>        queue a URL, file or search
random <d> [1-10]     queue a random mix
skip|pause|resume|stop <d>
seek <d> <time>       jump to SS, MM:SS or HH:MM:SS
rewind|forward <d> <time>
loop <d> off|track|queue
volume <d> <0-200>
status <d>            current track and queue
sessions              active destinations
leave <d>             disconnect
quit";

/// Runs one command and returns the reply text.
pub async fn execute(manager: &PlaybackManager, command: ConsoleCommand) -> Result<String> {
    let reply = match command {
        ConsoleCommand::Join(d) => {
            manager.join(d).await?;
            format!("🔊 Joined {}", d)
        }
        ConsoleCommand::Leave(d) => {
            manager.leave(d).await?;
            format!("👋 Left {}", d)
        }
        ConsoleCommand::Play(d, reference) => {
            let queued = manager.enqueue(d, &reference, Some("console")).await?;
            if queued.position == 0 {
                format!("🎶 Starting: {}", queued.track.title)
            } else {
                format!("➕ Queued #{}: {}", queued.position, queued.track.title)
            }
        }
        ConsoleCommand::Random(d, rolls) => {
            let (query, queued) = manager.enqueue_random(d, rolls, Some("console")).await?;
            format!("🎲 Random pick: {} (#{})", query, queued.position)
        }
        ConsoleCommand::Skip(d) => {
            let skipped = manager.skip(d).await?;
            format!("⏭️ Skipped: {}", skipped.title)
        }
        ConsoleCommand::Pause(d) => {
            manager.pause(d).await?;
            "⏸️ Paused".to_string()
        }
        ConsoleCommand::Resume(d) => {
            manager.resume(d).await?;
            "▶️ Resumed".to_string()
        }
        ConsoleCommand::Stop(d) => {
            manager.stop(d).await?;
            "⏹️ Stopped and cleared the queue".to_string()
        }
        ConsoleCommand::Seek(d, to) => {
            manager.seek(d, to).await?;
            format!("⏩ Seeked to {}", format_duration(to))
        }
        ConsoleCommand::Rewind(d, by) => {
            let now = current_position(manager, d).await?;
            let to = now.saturating_sub(by);
            manager.seek(d, to).await?;
            format!("⏪ Rewound to {}", format_duration(to))
        }
        ConsoleCommand::Forward(d, by) => {
            let to = current_position(manager, d).await?.saturating_add(by);
            manager.seek(d, to).await?;
            format!("⏩ Forwarded to {}", format_duration(to))
        }
        ConsoleCommand::Loop(d, mode) => {
            manager.set_loop_mode(d, mode).await?;
            format!("🔁 Loop: {:?}", mode).to_lowercase()
        }
        ConsoleCommand::Volume(d, percent) => {
            let applied = manager.set_volume(d, percent as f32 / 100.0).await?;
            format!("🔊 Volume: {:.0}%", applied * 100.0)
        }
        ConsoleCommand::Status(d) => match manager.status(d).await {
            Some(status) => describe(&status),
            None => "Nothing is playing.".to_string(),
        },
        ConsoleCommand::Sessions => {
            let sessions = manager.active_sessions();
            if sessions.is_empty() {
                "No active sessions".to_string()
            } else {
                let ids: Vec<String> = sessions.iter().map(ToString::to_string).collect();
                format!("Active: {}", ids.join(", "))
            }
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => "bye".to_string(),
    };
    Ok(reply)
}

async fn current_position(manager: &PlaybackManager, d: Destination) -> Result<Duration> {
    manager
        .status(d)
        .await
        .and_then(|s| s.position)
        .ok_or_else(|| anyhow!("Nothing is playing."))
}

/// Human summary of a session, in the spirit of a now-playing card.
pub fn describe(status: &SessionStatus) -> String {
    let mut out = match (&status.current_track, status.state) {
        (Some(track), state) if state != PlayerState::Idle => {
            let title = status.title.as_deref().unwrap_or(&track.title);
            let icon = if state == PlayerState::Paused { "⏸️" } else { "🎵" };
            let position = status.position.map(format_duration).unwrap_or_else(|| "…".into());
            match status.duration {
                Some(total) => format!("{} {} [{}/{}]", icon, title, position, format_duration(total)),
                None => format!("{} {} [{}]", icon, title, position),
            }
        }
        _ => "Nothing is playing.".to_string(),
    };

    out.push_str(&format!(
        "\n📋 {} in queue | 🔁 {:?} | 🔊 {:.0}%",
        status.queue_length,
        status.loop_mode,
        status.volume * 100.0
    ));
    if let Some(voice) = status.voice {
        out.push_str(&format!(" | 🔌 {}", voice));
    }
    out
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn describe_event(event: &PlaybackEvent) -> Option<String> {
    match event {
        PlaybackEvent::TrackStarted { destination, title, .. } => {
            Some(format!("[{}] 🎶 Now playing: {}", destination, title))
        }
        PlaybackEvent::TrackFailed {
            destination,
            track,
            error,
        } => Some(format!("[{}] ❌ Failed to play {}: {}", destination, track.title, error)),
        PlaybackEvent::QueueFinished { destination } => Some(format!("[{}] 📭 Queue finished", destination)),
        PlaybackEvent::SessionTerminated { destination, reason } => {
            Some(format!("[{}] 👋 Session ended ({:?})", destination, reason))
        }
        PlaybackEvent::VoiceState { .. } => None,
    }
}

/// Reads commands from stdin until `quit` or EOF.
pub async fn run_console(manager: Arc<PlaybackManager>) -> Result<()> {
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    info!("Consola atrasada, {} eventos omitidos", n);
                }
                Err(_) => break,
            }
        }
    });

    println!("🎵 open-relay console. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("⚠️ {}", e);
                continue;
            }
        };
        let quit = command == ConsoleCommand::Quit;

        match execute(&manager, command).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => {
                error!("Error ejecutando comando: {}", e);
                println!("❌ {}", e);
            }
        }
        if quit {
            break;
        }
    }

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::SessionDeps,
        config::Config,
        testing::{FakeGateway, FakeResolver, FakeTranscoder},
    };
    use pretty_assertions::assert_eq;

    fn manager() -> PlaybackManager {
        PlaybackManager::new(SessionDeps {
            config: Arc::new(Config::default()),
            resolver: Arc::new(FakeResolver::default()),
            transcoder: Arc::new(FakeTranscoder::new(10_000)),
            gateway: FakeGateway::auto(),
        })
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ConsoleCommand::parse("play 5 never gonna give you up").unwrap(),
            ConsoleCommand::Play(Destination(5), "never gonna give you up".into())
        );
        assert_eq!(
            ConsoleCommand::parse("seek 1 1:30").unwrap(),
            ConsoleCommand::Seek(Destination(1), Duration::from_secs(90))
        );
        assert_eq!(
            ConsoleCommand::parse("LOOP 2 queue").unwrap(),
            ConsoleCommand::Loop(Destination(2), LoopMode::Queue)
        );
        assert_eq!(ConsoleCommand::parse("random 3").unwrap(), ConsoleCommand::Random(Destination(3), 1));
        assert_eq!(ConsoleCommand::parse("quit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("play").is_err());
        assert!(ConsoleCommand::parse("play abc song").is_err());
        assert!(ConsoleCommand::parse("play 1").is_err());
        assert!(ConsoleCommand::parse("volume 1 300").is_err());
        assert!(ConsoleCommand::parse("seek 1 1:xx").is_err());
        assert!(ConsoleCommand::parse("dance 1").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(59)), "0:59");
        assert_eq!(format_duration(Duration::from_secs(61)), "1:01");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_session() {
        let manager = manager();
        let d = Destination(1);

        let reply = execute(&manager, ConsoleCommand::Play(d, "first".into())).await.unwrap();
        assert_eq!(reply, "🎶 Starting: first");
        let reply = execute(&manager, ConsoleCommand::Play(d, "second".into())).await.unwrap();
        assert_eq!(reply, "➕ Queued #1: second");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let reply = execute(&manager, ConsoleCommand::Forward(d, Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(reply.starts_with("⏩ Forwarded to 0:3"), "{}", reply);

        let reply = execute(&manager, ConsoleCommand::Volume(d, 150)).await.unwrap();
        assert_eq!(reply, "🔊 Volume: 150%");

        let status = execute(&manager, ConsoleCommand::Status(d)).await.unwrap();
        assert!(status.contains("🎵 first"), "{}", status);
        assert!(status.contains("1 in queue"), "{}", status);

        let reply = execute(&manager, ConsoleCommand::Skip(d)).await.unwrap();
        assert_eq!(reply, "⏭️ Skipped: first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_past_the_end_of_time() {
        let manager = manager();
        let d = Destination(2);
        execute(&manager, ConsoleCommand::Play(d, "song".into())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let reply = execute(&manager, ConsoleCommand::Forward(d, Duration::MAX)).await.unwrap();
        assert!(reply.starts_with("⏩ Forwarded to "), "{}", reply);
        let status = manager.status(d).await.unwrap();
        assert_eq!(status.position, Some(Duration::MAX));
    }

    #[test]
    fn test_parse_rejects_absurd_timestamps() {
        assert!(ConsoleCommand::parse("seek 1 1e300").is_err());
        assert!(ConsoleCommand::parse("forward 1 99999999999999999:00:00").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_errors_are_messages() {
        let manager = manager();
        let err = execute(&manager, ConsoleCommand::Pause(Destination(9))).await.unwrap_err();
        assert_eq!(err.to_string(), "Nothing is playing");
        let err = execute(&manager, ConsoleCommand::Rewind(Destination(9), Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Nothing is playing.");
    }
}
