use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::callbacks::{ClientCallbacks, ClientsStatus, FriendStatusChange, ReceivedMessage};
use crate::client::client_event::ClientEvent;
use crate::client::connection::Connection;
use crate::client::delivery::DeliveryEngine;
use crate::client::session::ClientSession;
use crate::protocol::bodies::{InboundSingleMessage, ReceiveAckBody, UserStatusUpdateBody};
use crate::protocol::command::Command;
use crate::protocol::frame::InboundFrame;


/// Processes the client's event queue: decodes inbound frames and routes them to the delivery
///  engine or the application, and feeds timer expiry and connection loss to the components
///  they belong to.
///
/// A frame that can not be decoded or processed is logged and dropped, it does not affect the
///  connection or later frames.
pub struct Dispatcher {
    session: Arc<ClientSession>,
    connection: Arc<dyn Connection>,
    delivery: Arc<DeliveryEngine>,
    callbacks: Arc<dyn ClientCallbacks>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<ClientSession>,
        connection: Arc<dyn Connection>,
        delivery: Arc<DeliveryEngine>,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Dispatcher {
        Dispatcher {
            session,
            connection,
            delivery,
            callbacks,
        }
    }

    #[instrument(name = "dispatcher", skip_all, fields(user = self.session.user_id()))]
    pub async fn run(self, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            if self.connection.is_shut_down() {
                break;
            }
            self.on_event(event).await;
        }
        debug!("dispatcher finished");
    }

    pub async fn on_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Inbound(frame) => self.on_frame(frame).await,
            ClientEvent::TransportLost { generation, reason } => self.connection.on_transport_lost(generation, &reason),
            ClientEvent::AckTimeout { message_id, attempt } => self.delivery.on_ack_timeout(&message_id, attempt).await,
        }
    }

    async fn on_frame(&self, raw: Bytes) {
        let frame = match InboundFrame::try_decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame that could not be decoded: {:#}", e);
                return;
            }
        };
        trace!("received frame {:?}", frame);

        let Some(command) = frame.known_command() else {
            info!("ignoring frame with unknown command {}", frame.command);
            return;
        };
        if let Err(e) = self.dispatch(command, frame).await {
            warn!("failed to process {:?} frame: {:#}", command, e);
        }
    }

    async fn dispatch(&self, command: Command, frame: InboundFrame) -> anyhow::Result<()> {
        match command {
            Command::LoginAck => debug!("LOGIN_ACK on an established connection"),
            Command::MessageAck => self.delivery.on_message_ack(frame.body_as()?).await,
            Command::MessageReceiveAck => self.delivery.on_receive_ack(frame.body_as()?).await,
            Command::SingleMessage => self.on_single_message(frame.body_as()?).await?,
            Command::UserOnlineStatusUpdateNotify | Command::UserOnlineStatusUpdateNotifySync => self.on_status_update(frame.body_as()?),
            Command::MultiLogin => self.callbacks.on_multi_login(&frame.body),
            other => info!("no handling for inbound {:?} frames - ignoring", other),
        }
        Ok(())
    }

    async fn on_single_message(&self, message: InboundSingleMessage) -> anyhow::Result<()> {
        debug!("received message {} from {}", message.message_id, message.from_id);

        self.callbacks.on_single_message(ReceivedMessage {
            sender_id: message.from_id.clone(),
            key: message.message_key,
            id: message.message_id.clone(),
            message_type: message.message_type,
            content: message.content(),
            send_time: message.send_time,
            sequence: message.message_sequence,
        });

        let ack = self.session.frame_with(Command::MessageReceiveAck, &ReceiveAckBody {
            from_id: self.session.user_id().to_string(),
            to_id: message.from_id,
            message_key: message.message_key,
            message_id: message.message_id,
            message_sequence: message.message_sequence,
            to_imei: message.imei,
            to_client_type: message.client_type,
        })?;
        self.connection.send_raw(ack).await
    }

    fn on_status_update(&self, update: UserStatusUpdateBody) {
        debug!("presence of {} changed to {}", update.user_id, update.user_clients_status.status);

        self.callbacks.on_friend_status_change(&update.user_id, FriendStatusChange {
            app_id: update.app_id,
            id: update.user_id.clone(),
            status: ClientsStatus {
                status: update.user_clients_status.status,
                clients_status_map: update.user_clients_status.clients_status_map,
            },
        });
    }
}
