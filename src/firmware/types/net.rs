/// Connection slot inside the registry. Stable for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u8);

/// Opaque transport socket handle. Reissued on every reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Dns,
    Connecting,
    Ready,
    Sending,
    Replied,
    Retry,
    Error,
    Server,
}

impl ConnState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Dns => "Dns",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::Sending => "Sending",
            Self::Replied => "Replied",
            Self::Retry => "Retry",
            Self::Error => "Error",
            Self::Server => "Server",
        }
    }

    /// An exchange is in flight and the loop has to keep polling it.
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Dns | Self::Connecting | Self::Sending | Self::Retry)
    }
}

/// Transport error codes, numbered like the lwIP `err_t` set so log lines
/// stay comparable with packet captures from the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    Mem,
    Buf,
    Timeout,
    Route,
    InProgress,
    Value,
    WouldBlock,
    Use,
    Already,
    IsConnected,
    Conn,
    Interface,
    Abort,
    Reset,
    Closed,
    Argument,
}

impl NetError {
    pub const fn code(self) -> i8 {
        match self {
            Self::Mem => -1,
            Self::Buf => -2,
            Self::Timeout => -3,
            Self::Route => -4,
            Self::InProgress => -5,
            Self::Value => -6,
            Self::WouldBlock => -7,
            Self::Use => -8,
            Self::Already => -9,
            Self::IsConnected => -10,
            Self::Conn => -11,
            Self::Interface => -12,
            Self::Abort => -13,
            Self::Reset => -14,
            Self::Closed => -15,
            Self::Argument => -16,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mem => "out_of_memory",
            Self::Buf => "buffer",
            Self::Timeout => "timeout",
            Self::Route => "no_route",
            Self::InProgress => "in_progress",
            Self::Value => "illegal_value",
            Self::WouldBlock => "would_block",
            Self::Use => "address_in_use",
            Self::Already => "already_connecting",
            Self::IsConnected => "already_connected",
            Self::Conn => "not_connected",
            Self::Interface => "netif",
            Self::Abort => "aborted",
            Self::Reset => "reset",
            Self::Closed => "closed",
            Self::Argument => "illegal_argument",
        }
    }

    /// Send buffer exhausted; the same payload may be written again later.
    pub const fn is_backpressure(self) -> bool {
        matches!(self, Self::Mem | Self::Buf)
    }
}
