//! Maintenance commands sent to the guest agent.
//!
//! Queries (`guesttime`, `guesttzone`) are answered asynchronously; the
//! answer lands in [`GuestLink::metadata`].

use tracing::debug;

use crate::error::Result;
use crate::protocol::GuestCommand;

use super::GuestLink;

impl GuestLink {
    /// Asks the guest for its date and time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn query_time(&self) -> Result<()> {
        self.send_command(&GuestCommand::GuestTime)
    }

    /// Asks the guest for its timezone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn query_timezone(&self) -> Result<()> {
        self.send_command(&GuestCommand::GuestTimezone)
    }

    /// Sets the guest's OS clock.
    ///
    /// # Arguments
    ///
    /// * `time` - New time in a format the guest's clock tool accepts
    /// * `local` - Interpret `time` as local time instead of UTC
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn set_os_time(&self, time: &str, local: bool) -> Result<()> {
        debug!(guest = %self.name(), time, local, "Setting guest clock");
        self.send_command(&GuestCommand::SetOsTime {
            time: time.to_string(),
            local,
        })
    }

    /// Runs a command with elevated rights on the guest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn run_elevated(&self, command: &str) -> Result<()> {
        self.send_command(&GuestCommand::RunElevated {
            command: command.to_string(),
        })
    }

    /// Asks the agent to remove its traces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn clean_up(&self, mode: &str) -> Result<()> {
        self.send_command(&GuestCommand::CleanUp {
            mode: mode.to_string(),
        })
    }

    /// Asks the agent to prepare a clean run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if
    /// the guest is not connected.
    pub fn init_clean(&self) -> Result<()> {
        self.send_command(&GuestCommand::InitClean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::args::encode_field;
    use crate::testing::FramePeer;

    #[tokio::test]
    async fn test_maintenance_payloads() {
        let link = GuestLink::builder("guest").build().expect("build");
        let (local, remote) = tokio::io::duplex(4096);
        link.attach(local);
        let mut peer = FramePeer::new(remote);

        link.query_time().expect("send");
        link.query_timezone().expect("send");
        link.set_os_time("2026-10-18 08:00:00", false).expect("send");
        link.init_clean().expect("send");

        assert_eq!(peer.recv().await, b"guesttime");
        assert_eq!(peer.recv().await, b"guesttzone");
        assert_eq!(
            peer.recv().await,
            format!("setOSTime {} False", encode_field("2026-10-18 08:00:00")).as_bytes()
        );
        assert_eq!(peer.recv().await, b"initClean");
    }
}
