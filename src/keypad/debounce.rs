//! Debounce and hold detection
//!
//! Turns raw, noisy key signals into semantic press and hold events. The
//! machine is owned by the single thread that polls the keypad and is never
//! shared.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::layout::{DoubleKey, Layout};

/// Most events buffered between polls before the oldest is discarded
const MAX_PENDING_EVENTS: usize = 16;

/// Kind of a raw key signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Key went down
    Down,
    /// Key came up
    Up,
    /// Key is still down (auto-repeat or re-poll)
    Repeat,
}

/// One raw signal from the key source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeySignal {
    pub code: u16,
    pub action: KeyAction,
    pub at: Instant,
}

impl RawKeySignal {
    #[must_use]
    pub const fn new(code: u16, action: KeyAction, at: Instant) -> Self {
        Self { code, action, at }
    }
}

/// Semantic key event produced once per poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Key symbol, `'-'` when no key
    pub symbol: char,
    /// Raw code that produced the event, `-1` when no key
    pub raw_code: i32,
    /// Whether this poll produced an event at all
    pub valid: bool,
    /// Set on the single hold event of a long press
    pub is_hold: bool,
}

impl KeyEvent {
    /// The "no key" result
    pub const NONE: Self = Self {
        symbol: '-',
        raw_code: -1,
        valid: false,
        is_hold: false,
    };

    fn press(symbol: char, code: u16) -> Self {
        Self {
            symbol,
            raw_code: i32::from(code),
            valid: true,
            is_hold: false,
        }
    }

    fn hold(symbol: char, code: u16) -> Self {
        Self {
            is_hold: true,
            ..Self::press(symbol, code)
        }
    }
}

/// Tuning for [`KeyStateMachine`]
#[derive(Debug, Clone, Copy)]
pub struct DebounceSettings {
    pub layout: Layout,
    pub hold_threshold: Duration,
    /// Consecutive silent polls that count as a release when the source
    /// cannot report releases itself
    pub release_polls: u32,
    /// Overrides the layout's own double-key window
    pub debounce_window: Option<Duration>,
    /// Whether the source delivers `Up` signals
    pub source_reports_release: bool,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            layout: Layout::Calculator,
            hold_threshold: Duration::from_millis(500),
            release_polls: 6,
            debounce_window: None,
            source_reports_release: true,
        }
    }
}

/// Key currently held down
#[derive(Debug, Clone, Copy)]
struct HoldState {
    held_symbol: char,
    held_code: u16,
    press_time: Instant,
    hold_fired: bool,
    silent_polls: u32,
    reported: bool,
}

/// First half of a possible double-key pair awaiting its partner
#[derive(Debug, Clone, Copy)]
struct Deferred {
    code: u16,
    since: Instant,
    released: bool,
}

/// `IDLE -> PRESSED -> (HELD)* -> IDLE`
#[derive(Debug)]
pub struct KeyStateMachine {
    settings: DebounceSettings,
    rule: DoubleKey,
    hold: Option<HoldState>,
    deferred: Option<Deferred>,
    /// Last accepted press, for duplicate suppression
    last_press: Option<(u16, Instant)>,
    events: VecDeque<KeyEvent>,
}

impl KeyStateMachine {
    #[must_use]
    pub fn new(settings: DebounceSettings) -> Self {
        let window = settings
            .debounce_window
            .unwrap_or_else(|| settings.layout.default_window());
        Self {
            rule: settings.layout.double_key(window),
            settings,
            hold: None,
            deferred: None,
            last_press: None,
            events: VecDeque::with_capacity(MAX_PENDING_EVENTS),
        }
    }

    /// Active layout
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.settings.layout
    }

    /// Switch layout, discarding any in-progress key state
    pub fn set_layout(&mut self, layout: Layout) {
        tracing::info!(?layout, "keypad layout changed");
        *self = Self::new(DebounceSettings {
            layout,
            ..self.settings
        });
    }

    /// Symbol of the key currently held, if any
    #[must_use]
    pub fn held_symbol(&self) -> Option<char> {
        self.hold.map(|h| h.held_symbol)
    }

    /// Feed the signals read since the last poll and produce this poll's event
    ///
    /// At most one event is returned per poll; extra events wait for later
    /// polls in arrival order.
    pub fn poll(
        &mut self,
        signals: impl IntoIterator<Item = RawKeySignal>,
        now: Instant,
    ) -> KeyEvent {
        if let Some(hold) = self.hold.as_mut() {
            hold.reported = false;
        }

        for signal in signals {
            self.feed(signal);
        }

        self.resolve_deferred(now);
        self.check_hold(now);
        self.check_silent_release();

        self.events.pop_front().unwrap_or(KeyEvent::NONE)
    }

    fn feed(&mut self, signal: RawKeySignal) {
        match signal.action {
            KeyAction::Down => self.on_down(signal.code, signal.at),
            KeyAction::Repeat => self.on_repeat(signal.code),
            KeyAction::Up => self.on_up(signal.code),
        }
    }

    fn on_down(&mut self, code: u16, at: Instant) {
        if let Some(pending) = self.deferred.take() {
            if pending.code == code
                && at.saturating_duration_since(pending.since) <= self.rule.window()
            {
                if let DoubleKey::Disambiguate { double, .. } = self.rule {
                    self.accept_press(double, code, pending.since);
                }
                return;
            }
            // Something else arrived first: the deferred signal was a lone press
            self.resolve_single(pending);
        }

        if let Some(hold) = self.hold.as_mut()
            && hold.held_code == code
        {
            hold.reported = true;
            return;
        }

        match self.rule {
            DoubleKey::Disambiguate { code: rule_code, .. } if rule_code == code => {
                self.deferred = Some(Deferred {
                    code,
                    since: at,
                    released: false,
                });
                return;
            }
            DoubleKey::Suppress {
                code: rule_code,
                window,
            } if rule_code == code => {
                if let Some((last, last_at)) = self.last_press
                    && last == code
                    && at.saturating_duration_since(last_at) < window
                {
                    tracing::trace!(code, "suppressed duplicate double-key signal");
                    return;
                }
            }
            _ => {}
        }

        match self.settings.layout.symbol(code) {
            Some(symbol) => self.accept_press(symbol, code, at),
            None => tracing::trace!(code, "ignoring unmapped key"),
        }
    }

    fn on_repeat(&mut self, code: u16) {
        if let Some(hold) = self.hold.as_mut()
            && hold.held_code == code
        {
            hold.reported = true;
        }
    }

    fn on_up(&mut self, code: u16) {
        if let Some(pending) = self.deferred.as_mut()
            && pending.code == code
        {
            pending.released = true;
        }
        if self.hold.is_some_and(|h| h.held_code == code) {
            self.hold = None;
        }
    }

    fn accept_press(&mut self, symbol: char, code: u16, at: Instant) {
        self.hold = Some(HoldState {
            held_symbol: symbol,
            held_code: code,
            press_time: at,
            hold_fired: false,
            silent_polls: 0,
            reported: true,
        });
        self.last_press = Some((code, at));
        self.push_event(KeyEvent::press(symbol, code));
    }

    fn resolve_deferred(&mut self, now: Instant) {
        let Some(pending) = self.deferred else {
            return;
        };
        if now.saturating_duration_since(pending.since) <= self.rule.window() {
            return;
        }
        self.deferred = None;
        self.resolve_single(pending);
    }

    /// Emit a deferred signal as a lone press
    fn resolve_single(&mut self, pending: Deferred) {
        if let DoubleKey::Disambiguate { single, .. } = self.rule {
            self.accept_press(single, pending.code, pending.since);
            if pending.released {
                self.hold = None;
            }
        }
    }

    fn check_hold(&mut self, now: Instant) {
        let Some(hold) = self.hold.as_mut() else {
            return;
        };
        if hold.hold_fired
            || now.saturating_duration_since(hold.press_time) < self.settings.hold_threshold
        {
            return;
        }
        hold.hold_fired = true;
        let event = KeyEvent::hold(hold.held_symbol, hold.held_code);
        tracing::debug!(symbol = %event.symbol, "key hold detected");
        self.push_event(event);
    }

    fn check_silent_release(&mut self) {
        if self.settings.source_reports_release {
            return;
        }
        let Some(hold) = self.hold.as_mut() else {
            return;
        };
        if hold.reported {
            hold.silent_polls = 0;
            return;
        }
        hold.silent_polls += 1;
        if hold.silent_polls >= self.settings.release_polls {
            self.hold = None;
        }
    }

    fn push_event(&mut self, event: KeyEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            tracing::warn!("keypad event backlog full, dropping oldest");
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}
