use clap::Parser;
use log::{error, info, warn};
use peer::config::DEFAULT_MULTICAST_GROUP;
use peer::{Node, NodeConfig, NodeEvent};
use rand::seq::SliceRandom;
use shared::{Direction, GameConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Headless snake peer. Hosts a session or joins the first one announced.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Player name shown to the other peers
    #[clap(short, long, default_value = "SnakePlayer")]
    name: String,
    /// Local unicast address to bind to
    #[clap(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,
    /// Multicast group used for session announcements
    #[clap(short, long, default_value = DEFAULT_MULTICAST_GROUP)]
    group: SocketAddr,
    /// Host a new session instead of joining one
    #[clap(long)]
    host: bool,
    /// Join as a viewer without a snake
    #[clap(long)]
    only_view: bool,
    /// Turn the snake at random every few ticks
    #[clap(long)]
    autopilot: bool,
    /// Field width in cells
    #[clap(long, default_value = "40")]
    width: i32,
    /// Field height in cells
    #[clap(long, default_value = "30")]
    height: i32,
    /// Food kept on the field regardless of player count
    #[clap(long, default_value = "1")]
    food_static: u32,
    /// Extra food per live snake
    #[clap(long, default_value = "1.0")]
    food_per_player: f32,
    /// Chance that a dead snake's cell turns into food
    #[clap(long, default_value = "0.1")]
    dead_food_prob: f32,
    /// Milliseconds between simulation ticks
    #[clap(long, default_value = "200")]
    state_delay_ms: u64,
    /// Milliseconds between keep-alives and retransmissions
    #[clap(long, default_value = "100")]
    ping_delay_ms: u64,
    /// Milliseconds of silence after which a peer counts as gone
    #[clap(long, default_value = "800")]
    node_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> NodeConfig {
        NodeConfig {
            player_name: self.name.clone(),
            bind_addr: self.bind,
            multicast_group: Some(self.group),
            game: GameConfig {
                width: self.width,
                height: self.height,
                food_static: self.food_static,
                food_per_player: self.food_per_player,
                dead_food_prob: self.dead_food_prob,
                state_delay_ms: self.state_delay_ms,
                ping_delay_ms: self.ping_delay_ms,
                node_timeout_ms: self.node_timeout_ms,
            },
            retry_interval: Duration::from_millis(self.ping_delay_ms),
            ..NodeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (node, mut events) = Node::start(args.config()).await?;
    info!("Peer {} started on {}", args.name, node.local_addr());

    let mut joining = !args.host;
    if args.host {
        node.start_own_game().await;
    } else {
        info!("Waiting for a session announcement on {}", args.group);
    }

    let mut autopilot = interval(Duration::from_millis(args.state_delay_ms * 5));
    autopilot.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    error!("Event stream closed");
                    break;
                };
                match event {
                    NodeEvent::SessionDiscovered(session) => {
                        if joining && session.can_join {
                            joining = false;
                            info!("Found {}'s session at {}", session.master_name, session.addr);
                            if let Err(e) = node.connect(&session, args.only_view).await {
                                error!("Failed to join {}: {}", session.addr, e);
                                joining = true;
                            }
                        }
                    }
                    NodeEvent::GameStarted => info!("Game started"),
                    NodeEvent::StateChanged(_) => {}
                    NodeEvent::MasterChanged(master) => info!("Master is now {:?}", master),
                    NodeEvent::RoleChanged(role) => info!("Our role is now {:?}", role),
                    NodeEvent::YouDied => warn!("Our snake died"),
                    NodeEvent::Info(text) => info!("{}", text),
                    NodeEvent::ConnectionFailed => {
                        warn!("Could not join, waiting for another announcement");
                        joining = true;
                    }
                    NodeEvent::Disconnected => {
                        warn!("Session lost");
                        joining = !args.host;
                        if args.host {
                            node.start_own_game().await;
                        }
                    }
                }
            }
            _ = autopilot.tick(), if args.autopilot => {
                if let Some(&direction) = Direction::ALL.choose(&mut rand::thread_rng()) {
                    if let Err(e) = node.steer(direction).await {
                        warn!("Failed to steer: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving the session...");
                node.leave().await;
                break;
            }
        }
    }

    node.shutdown();
    Ok(())
}
