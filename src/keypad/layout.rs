//! Keypad layouts and their double-key rules
//!
//! The USB numeric keypads this core supports have a wide `00` key that sends
//! two `KP0` signals a few tens of milliseconds apart. How those pairs are
//! treated depends on the layout, so the rule lives here rather than in the
//! state machine.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Linux input key codes used by the supported keypads
pub mod codes {
    pub const KEY_BACKSPACE: u16 = 14;
    pub const KEY_KPASTERISK: u16 = 55;
    pub const KEY_NUMLOCK: u16 = 69;
    pub const KEY_KP7: u16 = 71;
    pub const KEY_KP8: u16 = 72;
    pub const KEY_KP9: u16 = 73;
    pub const KEY_KPMINUS: u16 = 74;
    pub const KEY_KP4: u16 = 75;
    pub const KEY_KP5: u16 = 76;
    pub const KEY_KP6: u16 = 77;
    pub const KEY_KPPLUS: u16 = 78;
    pub const KEY_KP1: u16 = 79;
    pub const KEY_KP2: u16 = 80;
    pub const KEY_KP3: u16 = 81;
    pub const KEY_KP0: u16 = 82;
    pub const KEY_KPDOT: u16 = 83;
    pub const KEY_KPENTER: u16 = 96;
    pub const KEY_KPSLASH: u16 = 98;
}

use codes::{
    KEY_BACKSPACE, KEY_KP0, KEY_KP1, KEY_KP2, KEY_KP3, KEY_KP4, KEY_KP5, KEY_KP6, KEY_KP7,
    KEY_KP8, KEY_KP9, KEY_KPASTERISK, KEY_KPDOT, KEY_KPENTER, KEY_KPMINUS, KEY_KPPLUS,
    KEY_KPSLASH, KEY_NUMLOCK,
};

/// Physical key arrangement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Key labels match the printed calculator keys
    #[default]
    Calculator,
    /// Positional mapping with 1-2-3 on the top row
    Phone,
}

/// How a layout treats two signals for the same code inside a short window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleKey {
    /// The second signal is a hardware duplicate and is dropped
    Suppress { code: u16, window: Duration },
    /// A lone signal means `single`, a pair means `double`; the decision is
    /// deferred until the window closes
    Disambiguate {
        code: u16,
        single: char,
        double: char,
        window: Duration,
    },
}

impl DoubleKey {
    /// Raw code the rule applies to
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::Suppress { code, .. } | Self::Disambiguate { code, .. } => *code,
        }
    }

    /// Window inside which two signals form a pair
    #[must_use]
    pub const fn window(&self) -> Duration {
        match self {
            Self::Suppress { window, .. } | Self::Disambiguate { window, .. } => *window,
        }
    }
}

impl Layout {
    /// Wire code used by the config channel
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Calculator => 0,
            Self::Phone => 1,
        }
    }

    /// Decode a wire code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Calculator),
            1 => Some(Self::Phone),
            _ => None,
        }
    }

    /// Debounce window used when none is configured
    ///
    /// Measured `00` pairs arrive 16-24 ms apart.
    #[must_use]
    pub const fn default_window(self) -> Duration {
        match self {
            Self::Calculator => Duration::from_millis(50),
            Self::Phone => Duration::from_millis(30),
        }
    }

    /// The double-key rule for this layout
    #[must_use]
    pub const fn double_key(self, window: Duration) -> DoubleKey {
        match self {
            Self::Calculator => DoubleKey::Suppress {
                code: KEY_KP0,
                window,
            },
            Self::Phone => DoubleKey::Disambiguate {
                code: KEY_KP0,
                single: '*',
                double: '0',
                window,
            },
        }
    }

    /// Map a raw key code to its symbol
    ///
    /// In phone layout `KP0` has no fixed symbol; it is resolved by the
    /// double-key rule.
    #[must_use]
    pub const fn symbol(self, code: u16) -> Option<char> {
        match self {
            Self::Calculator => match code {
                KEY_KP0 => Some('0'),
                KEY_KP1 => Some('1'),
                KEY_KP2 => Some('2'),
                KEY_KP3 => Some('3'),
                KEY_KP4 => Some('4'),
                KEY_KP5 => Some('5'),
                KEY_KP6 => Some('6'),
                KEY_KP7 => Some('7'),
                KEY_KP8 => Some('8'),
                KEY_KP9 => Some('9'),
                KEY_KPSLASH => Some('A'),
                KEY_KPASTERISK => Some('B'),
                KEY_KPMINUS => Some('C'),
                KEY_KPPLUS => Some('D'),
                KEY_KPENTER => Some('#'),
                KEY_KPDOT => Some('*'),
                KEY_NUMLOCK => Some('X'),
                KEY_BACKSPACE => Some('Y'),
                _ => None,
            },
            Self::Phone => match code {
                KEY_KP1 => Some('7'),
                KEY_KP2 => Some('8'),
                KEY_KP3 => Some('9'),
                KEY_KP4 => Some('4'),
                KEY_KP5 => Some('5'),
                KEY_KP6 => Some('6'),
                KEY_KP7 => Some('1'),
                KEY_KP8 => Some('2'),
                KEY_KP9 => Some('3'),
                KEY_BACKSPACE => Some('A'),
                KEY_KPMINUS => Some('B'),
                KEY_KPPLUS => Some('C'),
                KEY_KPENTER => Some('D'),
                KEY_KPDOT => Some('#'),
                _ => None,
            },
        }
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "calculator" | "calc" => Ok(Self::Calculator),
            "phone" => Ok(Self::Phone),
            other => Err(format!("unknown keypad layout: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculator_labels() {
        let layout = Layout::Calculator;
        assert_eq!(layout.symbol(KEY_KP7), Some('7'));
        assert_eq!(layout.symbol(KEY_KP0), Some('0'));
        assert_eq!(layout.symbol(KEY_KPENTER), Some('#'));
        assert_eq!(layout.symbol(KEY_NUMLOCK), Some('X'));
        assert_eq!(layout.symbol(1), None);
    }

    #[test]
    fn test_phone_rows_are_flipped() {
        let layout = Layout::Phone;
        assert_eq!(layout.symbol(KEY_KP7), Some('1'));
        assert_eq!(layout.symbol(KEY_KP1), Some('7'));
        assert_eq!(layout.symbol(KEY_KP5), Some('5'));
        assert_eq!(layout.symbol(KEY_BACKSPACE), Some('A'));
        assert_eq!(layout.symbol(KEY_KP0), None);
        assert_eq!(layout.symbol(KEY_NUMLOCK), None);
    }

    #[test]
    fn test_rules_differ_per_layout() {
        let window = Duration::from_millis(40);
        assert!(matches!(
            Layout::Calculator.double_key(window),
            DoubleKey::Suppress { code: KEY_KP0, .. }
        ));
        let phone = Layout::Phone.double_key(window);
        assert_eq!(phone.code(), KEY_KP0);
        assert_eq!(phone.window(), window);
    }

    #[test]
    fn test_parse_and_codes() {
        assert_eq!("Phone".parse::<Layout>().unwrap(), Layout::Phone);
        assert!("qwerty".parse::<Layout>().is_err());
        for layout in [Layout::Calculator, Layout::Phone] {
            assert_eq!(Layout::from_code(layout.code()), Some(layout));
        }
    }
}
