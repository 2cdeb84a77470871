use std::fmt::{Display, Formatter};

/// The closed set of errors a send operation can report to the application.
///
/// Transport-level failures (connect timeouts, EOF on read, poll errors) are deliberately *not*
///  part of this set: they flow into the peer's connection state machine and the dial loop
///  recovers from them without the application ever seeing them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SendError {
    /// the target hostname is not in the peer table
    InvalidNode,
    /// the target is this node itself
    SendToMe,
    /// the peer has no established socket
    NoSock,
    /// the peer's connection is shutting down
    Closed,
    /// the frame could not be queued (includes sends gated on the peer's hello)
    WriteFail,
    /// the send queue is at its count or byte cap
    QueueFull,
    /// buffer allocation for the frame failed
    MallocFail,
    /// no ack arrived within the caller's wait budget
    Timeout,
    /// the remote handler passed a negative return code to the ack primitive
    InvalidAckRc,
    /// unexpected internal condition
    Internal,
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SendError::InvalidNode => "unknown peer",
            SendError::SendToMe => "send addressed to self",
            SendError::NoSock => "no socket to peer",
            SendError::Closed => "connection closed",
            SendError::WriteFail => "write failed",
            SendError::QueueFull => "send queue full",
            SendError::MallocFail => "frame allocation failed",
            SendError::Timeout => "timed out waiting for ack",
            SendError::InvalidAckRc => "remote handler returned an invalid ack code",
            SendError::Internal => "internal error",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for SendError {}
