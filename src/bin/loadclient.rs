//! Load-test client
//!
//! Usage: `loadclient <user> <to> [duration_secs] [interval_ms] [url]`
//!
//! Claims `<user>`, sends a chat to `<to>` every interval until the duration
//! elapses or Ctrl-C, then prints sent/received/error counts.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{ClaimUsernameRequest, ForwardMessageRequest, ServerMessage, Username};

const DEFAULT_URL: &str = "ws://127.0.0.1:8123/ws";
const DEFAULT_DURATION_SECS: u64 = 60;
const DEFAULT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Default)]
struct Stats {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loadclient=info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: loadclient <user> <to> [duration_secs] [interval_ms] [url]");
        std::process::exit(1);
    }
    let user = Username::new(args[1].clone());
    let to = Username::new(args[2].clone());
    let duration = Duration::from_secs(parse_or(args.get(3), DEFAULT_DURATION_SECS)?);
    let interval = Duration::from_millis(parse_or(args.get(4), DEFAULT_INTERVAL_MS)?);
    let url = args.get(5).map(String::as_str).unwrap_or(DEFAULT_URL);

    let stats = Arc::new(Stats::default());
    let start = Instant::now();

    tokio::select! {
        res = run_client(url, user.clone(), to.clone(), interval, stats.clone()) => {
            if let Err(e) = res {
                error!("[{}] exited with error: {}", user, e);
            }
        }
        _ = time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    println!(
        "\n--- client report ---\nuser={} to={}\nruntime={:?}\nsent={} recv={} errors={}",
        user,
        to,
        start.elapsed(),
        stats.sent.load(Ordering::Relaxed),
        stats.received.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed),
    );
    Ok(())
}

fn parse_or(arg: Option<&String>, default: u64) -> Result<u64, std::num::ParseIntError> {
    arg.map_or(Ok(default), |s| s.parse())
}

async fn run_client(
    url: &str,
    user: Username,
    to: Username,
    interval: Duration,
    stats: Arc<Stats>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    let claim = serde_json::to_string(&ClaimUsernameRequest { username: user.clone() })?;
    sink.send(Message::Text(claim.into())).await?;
    info!("[{}] connected to {}", user, url);

    let reader_stats = stats.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    reader_stats.received.fetch_add(1, Ordering::Relaxed);
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Broadcast { users, .. }) => {
                            debug!("online: {:?}", users)
                        }
                        Ok(ServerMessage::Chat { from_username, content, .. }) => {
                            debug!("{}: {}", from_username, content)
                        }
                        Err(e) => debug!("unrecognized frame: {}", e),
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => {
                    reader_stats.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
    });

    let mut ticker = time::interval(interval);
    let mut i: u64 = 0;
    loop {
        ticker.tick().await;
        if reader.is_finished() {
            return Err("connection closed by server".into());
        }

        let request = ForwardMessageRequest {
            to_username: to.clone(),
            content: format!("msg {i} from {user}"),
        };
        let json = serde_json::to_string(&request)?;
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        stats.sent.fetch_add(1, Ordering::Relaxed);
        i += 1;
    }
}
