//! Keypad input: layouts, raw sources and the debounce/hold state machine

mod debounce;
pub mod layout;
mod source;

use std::time::Instant;

pub use debounce::{DebounceSettings, KeyAction, KeyEvent, KeyStateMachine, RawKeySignal};
pub use layout::{DoubleKey, Layout};
pub use source::{EvdevSource, KeySource};

use crate::Result;

/// A key source paired with the state machine that interprets it
pub struct Keypad {
    source: Box<dyn KeySource>,
    machine: KeyStateMachine,
    signals: Vec<RawKeySignal>,
}

impl Keypad {
    /// Wrap a source
    ///
    /// Silent-poll release detection is enabled only for sources that
    /// cannot report key-up themselves.
    #[must_use]
    pub fn new(source: Box<dyn KeySource>, settings: DebounceSettings) -> Self {
        let settings = DebounceSettings {
            source_reports_release: source.reports_release(),
            ..settings
        };
        tracing::debug!(source = %source.describe(), layout = ?settings.layout, "keypad ready");

        Self {
            source,
            machine: KeyStateMachine::new(settings),
            signals: Vec::new(),
        }
    }

    /// Poll once: drain raw signals and return this cycle's event
    ///
    /// # Errors
    ///
    /// Returns error if the source fails; the state machine is left untouched
    pub fn read(&mut self) -> Result<KeyEvent> {
        self.signals.clear();
        self.source.read_signals(&mut self.signals)?;
        let event = self.machine.poll(self.signals.drain(..), Instant::now());

        if event.valid {
            tracing::debug!(symbol = %event.symbol, hold = event.is_hold, "key event");
        }
        Ok(event)
    }

    /// Switch layout
    pub fn set_layout(&mut self, layout: Layout) {
        self.machine.set_layout(layout);
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.machine.layout()
    }
}
