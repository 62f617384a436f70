//! TLS fatal alerts sent to rejected clients.
//!
//! The proxy never terminates TLS, but it can still answer a rejected
//! ClientHello with a plaintext alert record so that well-behaved clients
//! fail fast and can tell the rejection reasons apart.
//!
//! Wire format (7 bytes):
//! - byte 0: content type (21 = alert)
//! - bytes 1-2: legacy record version (3.0)
//! - bytes 3-4: record length (2)
//! - byte 5: alert level (2 = fatal)
//! - byte 6: alert description

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default bound on writing an alert record.
pub const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(3);

/// Record content type for alerts.
const CONTENT_TYPE_ALERT: u8 = 21;

/// Alert level: fatal.
const LEVEL_FATAL: u8 = 2;

/// Length of an alert record on the wire.
pub const ALERT_RECORD_LEN: usize = 7;

/// Alert descriptions the proxy emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    /// The client address is not allowed on the route.
    AccessDenied = 49,
    /// Anything that went wrong on the proxy side.
    InternalError = 80,
    /// No route matches the requested server name.
    UnrecognizedName = 112,
}

impl AlertDescription {
    /// Build the complete fatal alert record.
    pub fn record(self) -> [u8; ALERT_RECORD_LEN] {
        [CONTENT_TYPE_ALERT, 3, 0, 0, 2, LEVEL_FATAL, self as u8]
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AccessDenied => "access_denied",
            Self::InternalError => "internal_error",
            Self::UnrecognizedName => "unrecognized_name",
        };
        f.write_str(name)
    }
}

/// Send a fatal alert to the client.
///
/// The connection is being torn down regardless, so failures are only logged.
pub async fn send_alert<W>(stream: &mut W, description: AlertDescription, write_timeout: Duration)
where
    W: AsyncWrite + Unpin,
{
    let record = description.record();

    match timeout(write_timeout, stream.write_all(&record)).await {
        Ok(Ok(())) => debug!(alert = %description, "Alert sent"),
        Ok(Err(e)) => warn!(alert = %description, error = %e, "Failed to send alert"),
        Err(_) => warn!(alert = %description, "Alert write timed out"),
    }
}
