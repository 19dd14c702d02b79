use shared::domain::{ConnectionState, Direction};

use crate::error::DeskError;

/// Menu-bar style summary of a desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Busy,
    Alert,
    Idle,
    Up,
    Down,
}

pub fn status_text(
    connection: ConnectionState,
    is_online: bool,
    last_error: Option<&DeskError>,
) -> &'static str {
    match (connection, is_online, last_error) {
        (ConnectionState::Connecting, _, _) => "Connecting...",
        (ConnectionState::Open, true, _) => "Connected",
        (ConnectionState::Open, false, _) => "Desk offline",
        (ConnectionState::Closed, _, Some(error)) if error.is_connectivity() => "Internet offline",
        (ConnectionState::Closed, _, Some(_)) => "Error",
        (ConnectionState::Closed, _, None) => "Disconnected",
    }
}

pub fn indicator(connection: ConnectionState, is_online: bool, direction: Direction) -> Indicator {
    match (connection, is_online, direction) {
        (ConnectionState::Connecting, _, _) => Indicator::Busy,
        (ConnectionState::Closed, _, _) | (ConnectionState::Open, false, _) => Indicator::Alert,
        (ConnectionState::Open, true, Direction::Stopped) => Indicator::Idle,
        (ConnectionState::Open, true, Direction::MovingUp) => Indicator::Up,
        (ConnectionState::Open, true, Direction::MovingDown) => Indicator::Down,
    }
}

/// Height is only shown while the reading is trustworthy.
pub fn height_text(connection: ConnectionState, is_online: bool, height: Option<i32>) -> String {
    match (connection, is_online, height) {
        (ConnectionState::Open, true, Some(height)) => format!("{height} cm"),
        _ => "--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, StreamError};

    #[test]
    fn status_text_covers_every_connection_state() {
        let offline = DeskError::Stream(StreamError::Connect("dns error".into()));
        let rejected = DeskError::Stream(StreamError::Unauthorized);

        assert_eq!(status_text(ConnectionState::Connecting, false, Some(&offline)), "Connecting...");
        assert_eq!(status_text(ConnectionState::Open, true, None), "Connected");
        assert_eq!(status_text(ConnectionState::Open, false, None), "Desk offline");
        assert_eq!(status_text(ConnectionState::Closed, false, Some(&offline)), "Internet offline");
        assert_eq!(status_text(ConnectionState::Closed, true, Some(&rejected)), "Error");
        assert_eq!(status_text(ConnectionState::Closed, false, None), "Disconnected");
    }

    #[test]
    fn device_errors_do_not_change_open_status() {
        let error = DeskError::Device(DeviceError::Unauthorized("expired".into()));
        assert_eq!(status_text(ConnectionState::Open, true, Some(&error)), "Connected");
    }

    #[test]
    fn indicator_reflects_motion_only_when_trustworthy() {
        assert_eq!(
            indicator(ConnectionState::Open, true, Direction::MovingUp),
            Indicator::Up
        );
        assert_eq!(
            indicator(ConnectionState::Open, true, Direction::MovingDown),
            Indicator::Down
        );
        assert_eq!(
            indicator(ConnectionState::Open, false, Direction::MovingUp),
            Indicator::Alert
        );
        assert_eq!(
            indicator(ConnectionState::Closed, true, Direction::Stopped),
            Indicator::Alert
        );
        assert_eq!(
            indicator(ConnectionState::Connecting, true, Direction::Stopped),
            Indicator::Busy
        );
        assert_eq!(
            indicator(ConnectionState::Open, true, Direction::Stopped),
            Indicator::Idle
        );
    }

    #[test]
    fn height_text_hides_stale_values() {
        assert_eq!(height_text(ConnectionState::Open, true, Some(72)), "72 cm");
        assert_eq!(height_text(ConnectionState::Open, false, Some(72)), "--");
        assert_eq!(height_text(ConnectionState::Closed, true, Some(72)), "--");
        assert_eq!(height_text(ConnectionState::Open, true, None), "--");
    }
}
