//! Relay outputs. The `gpio` feature gates the real rppal driver; without
//! it, a mock board tracks the level it would drive and logs transitions.
//!
//! Everything above this module speaks logical ON/OFF only. The wiring's
//! electrical polarity is a deployment constant applied here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Signal level that energises a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// HIGH = ON, LOW = OFF.
    ActiveHigh,
    /// LOW = ON, HIGH = OFF (most opto-isolated relay boards).
    ActiveLow,
}

impl Polarity {
    /// Physical level for a logical state; `true` is HIGH.
    pub fn level(self, on: bool) -> bool {
        match self {
            Polarity::ActiveHigh => on,
            Polarity::ActiveLow => !on,
        }
    }
}

/// Index-addressed relay outputs. Setting a zone to the state it already
/// has must be harmless.
pub trait RelayBank: Send {
    fn len(&self) -> usize;
    fn set_zone(&mut self, zone: usize, on: bool);
    /// Logical state; unknown zones read as OFF.
    fn get_zone(&self, zone: usize) -> bool;

    fn all_off(&mut self) {
        for zone in 0..self.len() {
            self.set_zone(zone, false);
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    pins: Vec<OutputPin>, // zone index -> GPIO pin
    states: Vec<bool>,
    polarity: Polarity,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(relay_pins: &[u8], polarity: Polarity) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = Vec::with_capacity(relay_pins.len());

        for pin_num in relay_pins {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: drive OFF before anything else touches the pin.
            drive(&mut pin, polarity.level(false));
            info!(gpio = pin_num, zone = pins.len(), "relay registered");
            pins.push(pin);
        }

        Ok(Self {
            states: vec![false; pins.len()],
            pins,
            polarity,
        })
    }
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

#[cfg(feature = "gpio")]
impl RelayBank for RelayBoard {
    fn len(&self) -> usize {
        self.pins.len()
    }

    fn set_zone(&mut self, zone: usize, on: bool) {
        let Some(pin) = self.pins.get_mut(zone) else {
            warn!(zone, "set on unknown relay ignored");
            return;
        };
        drive(pin, self.polarity.level(on));
        self.states[zone] = on;
        debug!(zone, state = on_off(on), "relay driven");
    }

    fn get_zone(&self, zone: usize) -> bool {
        self.states.get(zone).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware; logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    states: Vec<bool>,
    levels: Vec<bool>, // physical level the real board would drive
    polarity: Polarity,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(relay_pins: &[u8], polarity: Polarity) -> Result<Self> {
        for (zone, pin_num) in relay_pins.iter().enumerate() {
            info!(zone, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
        }
        info!(?polarity, "[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            states: vec![false; relay_pins.len()],
            levels: vec![polarity.level(false); relay_pins.len()],
            polarity,
        })
    }

    #[cfg(test)]
    pub(crate) fn level(&self, zone: usize) -> Option<bool> {
        self.levels.get(zone).copied()
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayBank for RelayBoard {
    fn len(&self) -> usize {
        self.states.len()
    }

    fn set_zone(&mut self, zone: usize, on: bool) {
        if zone >= self.states.len() {
            warn!(zone, "[mock-gpio] set on unknown relay ignored");
            return;
        }
        self.states[zone] = on;
        self.levels[zone] = self.polarity.level(on);
        debug!(
            zone,
            state = on_off(on),
            high = self.levels[zone],
            "[mock-gpio] relay driven"
        );
    }

    fn get_zone(&self, zone: usize) -> bool {
        self.states.get(zone).copied().unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    // -- Polarity -----------------------------------------------------------

    #[test]
    fn active_low_inverts_level() {
        assert!(!Polarity::ActiveLow.level(true));
        assert!(Polarity::ActiveLow.level(false));
    }

    #[test]
    fn active_high_passes_level_through() {
        assert!(Polarity::ActiveHigh.level(true));
        assert!(!Polarity::ActiveHigh.level(false));
    }

    #[test]
    fn polarity_parses_from_config_words() {
        let p: Polarity = serde_json::from_str(r#""active_low""#).unwrap();
        assert_eq!(p, Polarity::ActiveLow);
    }

    // -- RelayBoard (mock) --------------------------------------------------

    #[test]
    fn board_registers_one_zone_per_pin() {
        let board = RelayBoard::new(&[17, 27, 22], Polarity::ActiveLow).unwrap();
        assert_eq!(board.len(), 3);
    }

    #[test]
    fn board_starts_all_off_at_off_level() {
        let board = RelayBoard::new(&[17, 27], Polarity::ActiveLow).unwrap();
        assert!(!board.get_zone(0));
        assert_eq!(board.level(0), Some(true)); // active-low OFF is HIGH
    }

    #[test]
    fn board_set_on_drives_polarity_level() {
        let mut board = RelayBoard::new(&[17], Polarity::ActiveLow).unwrap();
        board.set_zone(0, true);
        assert!(board.get_zone(0));
        assert_eq!(board.level(0), Some(false));

        let mut board = RelayBoard::new(&[17], Polarity::ActiveHigh).unwrap();
        board.set_zone(0, true);
        assert_eq!(board.level(0), Some(true));
    }

    #[test]
    fn board_set_is_idempotent() {
        let mut board = RelayBoard::new(&[17], Polarity::ActiveHigh).unwrap();
        board.set_zone(0, true);
        board.set_zone(0, true);
        assert!(board.get_zone(0));
    }

    #[test]
    fn board_all_off_resets_everything() {
        let mut board = RelayBoard::new(&[17, 27], Polarity::ActiveLow).unwrap();
        board.set_zone(0, true);
        board.set_zone(1, true);
        board.all_off();
        assert!(!board.get_zone(0));
        assert!(!board.get_zone(1));
    }

    #[test]
    fn board_unknown_zone_does_not_panic() {
        let mut board = RelayBoard::new(&[17], Polarity::ActiveLow).unwrap();
        board.set_zone(9, true);
        assert!(!board.get_zone(9));
        assert_eq!(board.len(), 1);
    }
}
