use std::cell::RefCell;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

mod panel;

pub use panel::{MemoryOptimizerPanel, PanelState, THRESHOLD_SLIDER_MINUTES};

/// Message exchanged over the UI bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub name: String,
    pub payload: Value,
}

impl UiMessage {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UiError {
    #[error("unknown UI message `{0}`")]
    UnknownMessage(String),

    #[error("malformed payload for `{name}`")]
    InvalidPayload {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outbound side of the UI bridge.
pub trait UiBridge {
    /// Sends a message to the UI.
    fn send(&self, message: UiMessage);
}

/// Writes each message as one line of JSON.
pub struct JsonLinesBridge<W: Write> {
    writer: RefCell<W>,
}

impl<W: Write> JsonLinesBridge<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: RefCell::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write> UiBridge for JsonLinesBridge<W> {
    fn send(&self, message: UiMessage) {
        let mut writer = self.writer.borrow_mut();
        let written = serde_json::to_writer(&mut *writer, &message)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = written {
            warn!(name = %message.name, %err, "failed to deliver UI message");
        }
    }
}
