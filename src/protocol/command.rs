use num_enum::{IntoPrimitive, TryFromPrimitive};


/// The command space of the IM protocol. The numeric values are stable wire values and are sent
///  as the first header field of every frame in both directions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Command {
    Login = 9000,
    SingleMessage = 1103,
    GroupMessage = 2104,
    MessageAck = 1046,
    /// mark messages in a conversation as read
    MessageRead = 1106,
    MessageReadReceipt = 1054,
    MessageReceiveAck = 1107,
    GroupMessageRead = 2106,
    GroupMessageReadReceipt = 2054,
    UserOnlineStatusUpdateNotify = 4002,
    UserOnlineStatusUpdateNotifySync = 4003,
    Logout = 9003,
    HeartBeat = 9999,

    // system commands, sent by the server only
    LoginAck = 9001,
    /// the same user logged in on another device of the same client type
    MultiLogin = 9002,
}

impl Command {
    pub fn code(self) -> u32 {
        self.into()
    }

    pub fn is_presence_notification(self) -> bool {
        matches!(self, Command::UserOnlineStatusUpdateNotify | Command::UserOnlineStatusUpdateNotifySync)
    }
}


/// Message content types as carried in the `messageType` header field and the message body
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MessageType {
    Text = 1,
    Image = 2,
    Video = 3,
}

impl MessageType {
    pub fn code(self) -> u32 {
        self.into()
    }
}
