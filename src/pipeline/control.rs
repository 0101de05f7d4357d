use serde::Deserialize;

/// Message posted by the host environment, e.g. `{"data": "ON"}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    pub data: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    On,
    Off,
}

impl ControlSignal {
    pub fn from_message(message: &ControlMessage) -> Option<Self> {
        match message.data.as_str() {
            "ON" => Some(ControlSignal::On),
            "OFF" => Some(ControlSignal::Off),
            _ => None,
        }
    }
}
