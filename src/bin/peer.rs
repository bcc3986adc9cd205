//! Aimlink Headless Peer
//!
//! Runs one session against a relay with a real WebRTC backend. Commands are
//! read from stdin, one per line; the session view is printed whenever it
//! changes.
//!
//! ```text
//! create | join <code> | start | hit | miss | stop | leave | dismiss
//! nick <name> | size <value> | duration <seconds> | quit
//! ```

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use aimlink::network::LobbyCode;
use aimlink::session::rtc::RtcConnector;
use aimlink::session::{
    SessionConfig, SessionController, SessionIntent, SessionState, SessionView, WsConnector,
};

fn parse_command(line: &str) -> Result<Option<SessionIntent>, String> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();

    let number = |arg: Option<&str>| -> Result<f64, String> {
        arg.ok_or_else(|| format!("{} needs a value", command))?
            .parse::<f64>()
            .map_err(|e| format!("bad value: {}", e))
    };

    let intent = match command {
        "create" => SessionIntent::Create,
        "join" => SessionIntent::Join(LobbyCode::new(arg.ok_or("join needs a code")?)),
        "start" => SessionIntent::Start,
        "hit" => SessionIntent::Hit,
        "miss" => SessionIntent::Miss,
        "stop" => SessionIntent::Stop,
        "leave" => SessionIntent::Leave,
        "dismiss" => SessionIntent::Dismiss,
        "nick" => SessionIntent::SetNick(arg.ok_or("nick needs a name")?.to_string()),
        "size" => SessionIntent::SetTargetSize(number(arg)?),
        "duration" => SessionIntent::SetGameDuration(number(arg)?),
        other => return Err(format!("unknown command: {}", other)),
    };
    Ok(Some(intent))
}

fn render(view: &SessionView) -> String {
    let mut line = format!("[{:?}]", view.state);
    if let Some(code) = &view.code {
        line.push_str(&format!(" lobby={}", code));
    }
    for player in view.roster.players() {
        line.push_str(&format!(" {}={}", player.nick, player.score));
    }
    if let Some(n) = view.countdown {
        line.push_str(&format!(" countdown={}", n));
    }
    if view.state == SessionState::Playing {
        if let Some(t) = view.time_left {
            line.push_str(&format!(" time={:.1}", t));
        }
    }
    if let Some(results) = &view.results {
        line.push_str(&format!(" result={:?}", results.outcome));
    }
    if let Some(error) = &view.error {
        line.push_str(&format!(" error=\"{}\"", error));
    }
    line
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = SessionConfig::from_env();
    let signaling = WsConnector::new(config.relay_url.clone());
    let peers = RtcConnector::new(config.stun_servers.clone());
    let (controller, mut handle) = SessionController::new(config, signaling, peers);
    tokio::spawn(controller.run());

    let mut views = handle.subscribe();
    tokio::spawn(async move {
        let mut last = String::new();
        while views.changed().await.is_ok() {
            let line = render(&views.borrow_and_update());
            if line != last {
                println!("{}", line);
                last = line;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim() == "quit" {
                    break;
                }
                match parse_command(&line) {
                    Ok(Some(intent)) => {
                        if !handle.send(intent) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                }
            }
            cue = handle.next_cue() => {
                match cue {
                    Some(cue) => println!("cue: {:?}", cue),
                    None => break,
                }
            }
        }
    }

    handle.send(SessionIntent::Leave);
    Ok(())
}
