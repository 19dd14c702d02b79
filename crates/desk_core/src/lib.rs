pub mod controller;
pub mod device_api;
pub mod error;
pub mod fleet;
pub mod parser;
pub mod sequencer;
mod sse;
pub mod status;
pub mod stream;

pub use controller::{
    DeskChange, DeskConfig, DeskController, DeskSnapshot, MoveOutcome, PendingCommand,
};
pub use device_api::{CloudDeviceApi, DeviceApi, HeightReading};
pub use error::{DeskError, DeviceError, FleetError, StreamError};
pub use fleet::{FleetEvent, FleetRegistry};
pub use sequencer::{
    next_preset_above, next_preset_below, ActiveTarget, PresetSequencer, SequencerEvent,
    TargetOutcome, TargetToken,
};
pub use status::Indicator;
pub use stream::{EventStreamConnector, SseConnector, StreamOptions};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
