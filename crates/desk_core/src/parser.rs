use shared::protocol::{
    EVENT_DEVICE_STATUS, EVENT_HEIGHT, EVENT_MOVE_TIMEOUT, EVENT_MOVING_DOWN, EVENT_MOVING_UP,
    EVENT_TARGET_REACHED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskEvent {
    MovingDown,
    MovingUp,
    TargetReached,
    MoveTimeout,
    Height(i32),
    DeviceOnline,
    DeviceOffline,
}

/// Decodes a pushed event. Unknown names and malformed bodies yield `None`.
pub fn parse_event(name: &str, body: &str) -> Option<DeskEvent> {
    match name {
        EVENT_MOVING_DOWN => Some(DeskEvent::MovingDown),
        EVENT_MOVING_UP => Some(DeskEvent::MovingUp),
        EVENT_TARGET_REACHED => Some(DeskEvent::TargetReached),
        EVENT_MOVE_TIMEOUT => Some(DeskEvent::MoveTimeout),
        EVENT_HEIGHT => body.trim().parse().ok().map(DeskEvent::Height),
        EVENT_DEVICE_STATUS => match body {
            "online" => Some(DeskEvent::DeviceOnline),
            "offline" => Some(DeskEvent::DeviceOffline),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/parser_tests.rs"]
mod tests;
