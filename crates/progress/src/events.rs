//! Events published by the progress channel.

use crate::messages::ProgressUpdate;
use crate::reconnect::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The connection state machine moved.
    StateChanged(ConnectionState),

    /// A validated progress report.
    Progress(ProgressUpdate),

    /// Retries were exhausted; the channel stays disconnected until
    /// explicitly told to reconnect.
    ConnectionFailed { attempts: u32 },
}
