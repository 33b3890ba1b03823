use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ds::RedisDeliveryService;
use reliable_pubsub::{
    chat::{render, ChatClient},
    cli::{Args, Command},
    coordinator::Coordinator,
    driver::{run_driver, IntervalScheduler},
    logging::init_logging,
    reliable::ReliableChannel,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = init_logging(&args.log_level);
    let config = args.node_config();
    info!("Starting {} (log filter {level})", config.identity);

    let service = RedisDeliveryService::connect(config.delivery.clone())
        .await
        .context("failed to connect to the pub/sub channel")?;
    let reliable_config = config
        .reliable_config()
        .await
        .context("failed to set up the message stores")?;
    let mut channel = ReliableChannel::connect(&config.identity, service, reliable_config)?;
    let mut scheduler = IntervalScheduler::new(config.tick_interval);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
            token.cancel();
        });
    }

    match args.command {
        Command::Coordinator { clients, .. } => {
            channel.register_callback(|envelope| println!("Received: {}", render(envelope)));
            let mut coordinator = Coordinator::new(clients);
            run_driver(&mut channel, &mut scheduler, &mut coordinator, token).await;
        }
        Command::Chat { coordinator, .. } => {
            channel.register_callback(|envelope| println!("{}", render(envelope)));
            let mut client = ChatClient::new(&coordinator, spawn_stdin_reader(token.clone()));
            run_driver(&mut channel, &mut scheduler, &mut client, token).await;
        }
    }

    info!("Bye!");
    Ok(())
}

/// Forward stdin lines until EOF, `quit` or `exit`. Dropping the sender marks
/// the chat input closed; the driver then stops once the lines are confirmed.
fn spawn_stdin_reader(token: CancellationToken) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if matches!(line.trim(), "quit" | "exit") => break,
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });
    rx
}
