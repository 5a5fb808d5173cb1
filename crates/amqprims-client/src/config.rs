use std::fmt;
use std::time::Duration;

use amqprims_frame::FRAME_MIN_SIZE;

/// Default frame size requested during tuning: 128 KiB.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Default heartbeat interval requested during tuning, in seconds.
pub const DEFAULT_HEARTBEAT: u16 = 60;

/// Default channel limit requested during tuning.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// PLAIN credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    /// Sent in clear text inside Connection.StartOk and never logged.
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// SASL PLAIN response: `\0username\0password`.
    pub(crate) fn plain_response(&self) -> Vec<u8> {
        let mut response = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        response
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field(
                "password",
                &format_args!("<redacted:{} bytes>", self.password.len()),
            )
            .finish()
    }
}

/// Connection limits exchanged in Connection.Tune / TuneOk.
///
/// `0` means no limit for `channel_max` and `frame_max`. A client
/// `heartbeat` of `0` disables heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

impl Tunables {
    /// Combine what we asked for with what the broker offered.
    pub fn negotiate(&self, offered: &Tunables) -> Tunables {
        let frame_max = match negotiate(self.frame_max, offered.frame_max) {
            0 => 0,
            n => n.max(FRAME_MIN_SIZE),
        };
        let heartbeat = if self.heartbeat == 0 {
            0
        } else {
            negotiate(self.heartbeat, offered.heartbeat)
        };
        Tunables {
            channel_max: negotiate(self.channel_max, offered.channel_max),
            frame_max,
            heartbeat,
        }
    }

    /// Highest usable channel id.
    pub fn max_channel_id(&self) -> u16 {
        match self.channel_max {
            0 => u16::MAX,
            n => n,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }
}

fn negotiate<T: Ord + Default + Copy>(ours: T, theirs: T) -> T {
    let zero = T::default();
    if ours == zero {
        theirs
    } else if theirs == zero {
        ours
    } else {
        ours.min(theirs)
    }
}

/// Everything needed to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub credentials: Credentials,
    pub virtual_host: String,
    pub tunables: Tunables,
    pub locale: String,
    /// Shown in the broker's management UI.
    pub connection_name: Option<String>,
    /// Bound on connect plus the whole Start/Tune/Open exchange.
    pub handshake_timeout: Duration,
    /// How long `close` waits for the broker's CloseOk.
    pub close_timeout: Duration,
    /// Default deadline for synchronous channel calls. `None` waits forever.
    pub rpc_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            virtual_host: "/".to_string(),
            tunables: Tunables::default(),
            locale: "en_US".to_string(),
            connection_name: None,
            handshake_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            rpc_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.tunables.heartbeat = seconds;
        self
    }

    pub fn with_frame_max(mut self, frame_max: u32) -> Self {
        self.tunables.frame_max = frame_max;
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.tunables.channel_max = channel_max;
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }
}
