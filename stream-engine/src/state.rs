//! Stream finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::stream::Stream`] can occupy,
//! mirroring the TCP state diagram (RFC 793 §3.2).  Transitions live in
//! [`crate::stream`], one handler per state; this module only names the
//! states and answers a few questions about them.

/// All possible states of the stream FSM.
///
/// ```text
///                      open()
///   LISTEN ──SYN──▶ SYN_RCVD      SYN_SENT ──SYN-ACK──▶ ESTABLISHED
///                      │                                  │     │
///                      └────────ACK────────▶ ESTABLISHED  │     │
///                                                         │     │
///                         close_sending() ◀───────────────┘     └──FIN──▶ CLOSE_WAIT
///                               │                                              │
///                               ▼                                 close_sending()
///   FIN_WAIT_1 ──ACK──▶ FIN_WAIT_2 ──FIN──▶ TIME_WAIT                          ▼
///       │                                       ▲                          LAST_ACK
///       └──FIN──▶ CLOSING ──────ACK─────────────┘                              │
///                                                                              ACK
///   TIME_WAIT ──2×MSL──▶ CLOSE ◀───────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Passive stream waiting for a SYN; also the pooled state.
    Listen,
    /// SYN has been sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received; SYN-ACK sent; waiting for ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// ACK of local FIN received; waiting for peer's FIN.
    FinWait2,
    /// Terminal.  The stream is eligible for recycling.
    Close,
    /// Peer's FIN received; local close pending.
    CloseWait,
    /// Both sides sent FIN before seeing the other's ACK.
    Closing,
    /// Waiting for the final ACK of our FIN.
    LastAck,
    /// Waiting 2×MSL so delayed duplicates cannot reach a reused identity.
    TimeWait,
}

impl StreamState {
    /// `true` once both initial sequence numbers are known.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Self::Listen | Self::SynSent | Self::Close)
    }

    /// `true` while the local side may still queue data.
    pub fn can_send(self) -> bool {
        matches!(self, Self::SynSent | Self::Established | Self::CloseWait)
    }

    /// `true` once the local side has requested its FIN.
    pub fn is_sending_closed(self) -> bool {
        matches!(
            self,
            Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Close
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::Listen
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
