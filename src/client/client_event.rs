use bytes::Bytes;


/// Everything that happens to a client is funneled through a single queue of these events, and
///  handled one at a time in arrival order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientEvent {
    /// a raw frame from the server, not decoded yet
    Inbound(Bytes),
    /// The connection with the given generation failed or was closed. Generations are
    ///  numbered per connection attempt, which allows ignoring late reports about connections
    ///  that were replaced in the meantime.
    TransportLost {
        generation: u64,
        reason: String,
    },
    /// The ack timer of a pending message expired. `attempt` is the message's retry count
    ///  when the timer was started.
    AckTimeout {
        message_id: String,
        attempt: u32,
    },
}
