//! Payloads sent from the guest to the host.
//!
//! The host never dispatches methods; it only updates bookkeeping from these
//! events.
//!
//! # Event Types
//!
//! | Verb | Fields | Host effect |
//! |------|--------|-------------|
//! | `register` | `<ipInternet> <ipLocal> <mac> <ifaceInternet> <ifaceLocal>` | binds the socket to a link |
//! | `application` | `<module> <windowId> <event>…` | updates window flags |
//! | `shellExecComplete` | `<id> <exitCode> <b64 stdout> <b64 stderr>` | completes a ShellExec |
//! | `time` | `<date> <time>` | link metadata |
//! | `tzone` | `<b64 timezone>` | link metadata |
//! | `info` | `<b64 json>` | link metadata |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::{ShellExecId, WindowId};

use super::command::{CommandBuilder, Tokens, Verb};

// ============================================================================
// WindowEvent
// ============================================================================

/// Window state vocabulary shared by host and guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowEvent {
    /// The application finished opening.
    Opened,
    /// A method started running.
    Busy,
    /// The last method finished.
    Ready,
    /// The last method failed or timed out.
    Error,
}

impl WindowEvent {
    /// Returns the wire token.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Busy => "busy",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WindowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opened" => Ok(Self::Opened),
            "busy" => Ok(Self::Busy),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(Error::invalid_argument(format!("unknown window event {other:?}"))),
        }
    }
}

// ============================================================================
// NetworkInfo
// ============================================================================

/// Network identity a guest announces in its `register` handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Address of the internet facing interface.
    pub ip_internet: String,
    /// Address of the management interface.
    pub ip_local: String,
    /// MAC address used to match the guest to its link.
    pub mac: String,
    /// Name of the internet facing interface.
    pub iface_internet: String,
    /// Name of the management interface.
    pub iface_local: String,
}

// ============================================================================
// HostEvent
// ============================================================================

/// Every payload the host accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Handshake, first frame on a new connection.
    Register(NetworkInfo),
    /// Window state change.
    Application {
        /// Module name.
        module: String,
        /// Window the events refer to.
        window_id: WindowId,
        /// Recognised event tokens, in payload order.
        events: Vec<WindowEvent>,
    },
    /// Completion of a ShellExec request.
    ShellExecComplete {
        /// Correlation id.
        id: ShellExecId,
        /// Process exit code.
        exit_code: i32,
        /// Captured standard output.
        stdout: Vec<u8>,
        /// Captured standard error.
        stderr: Vec<u8>,
    },
    /// Guest date and time.
    Time {
        /// Date, `YYYY-MM-DD`.
        date: String,
        /// Time of day, `HH:MM:SS`.
        time: String,
    },
    /// Guest timezone name.
    Timezone(String),
    /// Free-form guest information, JSON by convention.
    Info(Vec<u8>),
}

impl HostEvent {
    /// Parses a payload received by the host.
    ///
    /// Unknown tokens inside an `application` event are skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownVerb`] if the verb is not part of the protocol
    /// - [`Error::MalformedCommand`] if fields are missing or invalid
    /// - [`Error::Base64`] if a base64 field does not decode
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut tokens = Tokens::new(payload)?;

        let event = match tokens.verb() {
            Verb::Register => Self::Register(NetworkInfo {
                ip_internet: tokens.token("internet address")?.to_string(),
                ip_local: tokens.token("local address")?.to_string(),
                mac: tokens.token("mac")?.to_ascii_lowercase(),
                iface_internet: tokens.token("internet interface")?.to_string(),
                iface_local: tokens.token("local interface")?.to_string(),
            }),

            Verb::Application => {
                let module = tokens.token("module")?.to_string();
                let window_id = tokens.parse("window id")?;
                let events = tokens
                    .rest_fields()
                    .into_iter()
                    .filter_map(|field| std::str::from_utf8(field).ok())
                    .filter_map(|token| token.parse().ok())
                    .collect();
                Self::Application {
                    module,
                    window_id,
                    events,
                }
            }

            Verb::ShellExecComplete => Self::ShellExecComplete {
                id: tokens.parse("id")?,
                exit_code: tokens.parse("exit code")?,
                stdout: tokens.opt_bytes()?.unwrap_or_default(),
                stderr: tokens.opt_bytes()?.unwrap_or_default(),
            },

            Verb::Time => Self::Time {
                date: tokens.token("date")?.to_string(),
                time: tokens.token("time")?.to_string(),
            },

            Verb::Tzone => Self::Timezone(tokens.text("timezone")?),

            Verb::Info => Self::Info(tokens.opt_bytes()?.unwrap_or_default()),

            verb => {
                return Err(Error::malformed(verb.as_str(), "not accepted by the host"));
            }
        };

        Ok(event)
    }

    /// Renders the event as a wire payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Self::Register(info) => CommandBuilder::new(Verb::Register)
                .token(&info.ip_internet)
                .token(&info.ip_local)
                .token(&info.mac)
                .token(&info.iface_internet)
                .token(&info.iface_local)
                .build(),
            Self::Application {
                module,
                window_id,
                events,
            } => events
                .iter()
                .fold(
                    CommandBuilder::new(Verb::Application)
                        .token(module)
                        .token(window_id),
                    |builder, event| builder.token(event),
                )
                .build(),
            Self::ShellExecComplete {
                id,
                exit_code,
                stdout,
                stderr,
            } => CommandBuilder::new(Verb::ShellExecComplete)
                .token(id)
                .token(exit_code)
                .field(stdout)
                .field(stderr)
                .build(),
            Self::Time { date, time } => CommandBuilder::new(Verb::Time)
                .token(date)
                .token(time)
                .build(),
            Self::Timezone(zone) => CommandBuilder::new(Verb::Tzone).field(zone).build(),
            Self::Info(info) => CommandBuilder::new(Verb::Info).field(info).build(),
        }
    }

    /// Builds a single-event `application` payload.
    #[must_use]
    pub fn window(module: impl Into<String>, window_id: WindowId, event: WindowEvent) -> Self {
        Self::Application {
            module: module.into(),
            window_id,
            events: vec![event],
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
