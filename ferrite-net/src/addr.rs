//! Server address with transport-variant flags.

use std::fmt;

/// Where to connect, plus the variant flags that shape the endpoint.
///
/// For raw TCP transports only `host:port` matters. Callers bridging to a
/// WebSocket transport build the endpoint URL with
/// [`ws_url`](ServerAddr::ws_url), which encodes the test-mode and premium
/// flags into the path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerAddr {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Target the test deployment.
    pub test_mode: bool,
    /// Use the premium endpoint variant.
    pub premium: bool,
}

impl ServerAddr {
    /// A plain production endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, test_mode: false, premium: false }
    }

    /// The WebSocket endpoint URL for this address, e.g.
    /// `wss://host:port/apiws_test` (always with the `binary` subprotocol).
    pub fn ws_url(&self, scheme: &str) -> String {
        format!(
            "{scheme}://{}:{}/apiws{}{}",
            self.host,
            self.port,
            if self.test_mode { "_test" } else { "" },
            if self.premium { "_premium" } else { "" },
        )
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
