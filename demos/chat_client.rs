use std::sync::Arc;

use clap::Parser;
use clap_derive::Parser;
use imclient::auth::storage::{InMemoryTokenStorage, InMemoryUserInfoStorage, NoopLogoutService, TokenStorage, UserInfo};
use imclient::auth::token_coordinator::TokenCoordinator;
use imclient::client::callbacks::{ClientCallbacks, FriendStatusChange, MessageAckEvent, ReceivedMessage};
use imclient::client::client_config::ClientConfig;
use imclient::client::im_client::ImClient;
use imclient::client::session::SessionParams;
use imclient::clock::time_calibrator::TimeCalibrator;
use imclient::clock::{CalibrationConfig, SystemClock};
use imclient::http::http_api::{HttpApi, HttpConfig, RefreshChannel};
use imclient::protocol::command::MessageType;
use imclient::transport::websocket::WebSocketConnector;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

/// Chat from the command line: every line of input of the form `<to-id> <text>` is sent as a
///  text message.
#[derive(Parser)]
struct Args {
    ws_url: String,
    http_url: String,
    user_id: String,
    token: String,

    #[clap(long, default_value_t = 10000)]
    app_id: u32,

    #[clap(long, default_value = "chat-client-demo")]
    device_id: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PrintingCallbacks {}

impl ClientCallbacks for PrintingCallbacks {
    fn on_message_ack(&self, event: MessageAckEvent) {
        match event.error_msg {
            Some(error_msg) => println!("[{}] {:?}: {}", event.message_id, event.status, error_msg),
            None => println!("[{}] {:?}", event.message_id, event.status),
        }
    }

    fn on_single_message(&self, message: ReceivedMessage) {
        println!("{}: {}", message.sender_id, message.content);
    }

    fn on_friend_status_change(&self, friend_id: &str, change: FriendStatusChange) {
        println!("* {} is {}", friend_id, if change.status.status == 1 { "online" } else { "offline" });
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let token_storage = Arc::new(InMemoryTokenStorage::new());
    token_storage.set_access_token(&args.user_id, &args.token).await?;
    let user_info_storage = Arc::new(InMemoryUserInfoStorage::with_user(UserInfo {
        app_id: args.app_id,
        user_id: args.user_id.clone(),
        ..Default::default()
    }));

    let http_config = HttpConfig::new(&args.http_url, args.app_id, &args.device_id);
    let tokens = Arc::new(TokenCoordinator::new(
        token_storage,
        user_info_storage,
        Arc::new(NoopLogoutService {}),
        Arc::new(RefreshChannel::new(&http_config)?),
    ));
    tokens.load().await?;
    let http_api = Arc::new(HttpApi::new(http_config, tokens)?);

    let calibrator = TimeCalibrator::spawn(CalibrationConfig::new(), Arc::new(SystemClock {}), http_api);
    if let Err(e) = calibrator.sync_time().await {
        warn!("initial time sync failed, using local time: {:#}", e);
    }

    let client = ImClient::new(ClientConfig::new(), Arc::new(WebSocketConnector::new()), calibrator)?;
    client.init(SessionParams {
        ws_url: args.ws_url,
        http_url: args.http_url,
        user_id: args.user_id,
        token: args.token,
        app_id: args.app_id,
        device_id: args.device_id,
    }, Arc::new(PrintingCallbacks {})).await?;
    info!("online - type '<to-id> <text>' to send a message");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some((to_id, text)) = line.trim().split_once(' ') else {
            println!("usage: <to-id> <text>");
            continue;
        };

        let message_id = ImClient::generate_message_id();
        let result = client.send_message(&message_id, to_id, text, MessageType::Text).await?;
        if !result.sent {
            println!("not connected - message was not sent");
        }
    }

    client.destroy().await;
    Ok(())
}
