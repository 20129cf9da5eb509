pub const VERSION: &str = "1.0.0";

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_CONFIGFILE_PATH: &str = "ELProxy.conf";

/// Default TCP port the proxy listens on for its one client.
pub const DEFAULT_PORT: u16 = 8100;

/// Upstream ports on the EchoLink peer network.
pub const UDP_CONTROL_PORT: u16 = 5199;
pub const UDP_DATA_PORT: u16 = 5198;
pub const TCP_PEER_PORT: u16 = 5200;

/// Registration reporter.
pub const REGISTRATION_HOST: &str = "www.echolink.org";
pub const REGISTRATION_PORT: u16 = 80;
pub const REGISTRATION_PATH: &str = "/proxypost.jsp";
pub const REGISTRATION_PERIOD_MS: u64 = 600_000;
pub const REGISTRATION_SALT: &str = "#5A!zu";
pub const REGISTRATION_PROTOCOL_VERSION: &str = "1.2.3o";
pub const USER_AGENT: &str = "OpenELP/1.0.0";

/// Literal password value that enables public (unauthenticated-by-callsign)
/// mode.
pub const PUBLIC_PASSWORD: &str = "PUBLIC";

/// Handshake timing.
pub const HANDSHAKE_READ_TIMEOUT_MS: u64 = 5_000;
