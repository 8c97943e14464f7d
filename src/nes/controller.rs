use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Standard pad buttons in shift-register order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    A,
    B,
    Select,
    Start,
    Up,
    Down,
    Left,
    Right,
}

impl Button {
    pub const ALL: [Button; 8] = [
        Button::A,
        Button::B,
        Button::Select,
        Button::Start,
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
    ];

    pub fn mask(self) -> u8 {
        1 << (self as u8)
    }
}

/// Port-1 joypad. Buttons are latched as a bitmask, bit 0 = A.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Controller {
    buttons: u8,
    index: u8,
    strobe: bool,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.buttons |= button.mask();
        } else {
            self.buttons &= !button.mask();
        }
    }

    pub fn set_state(&mut self, buttons: u8) {
        self.buttons = buttons;
    }

    pub fn state(&self) -> u8 {
        self.buttons
    }

    pub fn write(&mut self, value: u8) {
        self.strobe = (value & 0x01) != 0;
        if self.strobe {
            self.index = 0;
        }
    }

    pub fn read(&mut self) -> u8 {
        if self.index > 7 {
            return 1;
        }
        let bit = (self.buttons >> self.index) & 0x01;
        if !self.strobe {
            self.index += 1;
        }
        bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_buttons_in_order() {
        let mut pad = Controller::new();
        pad.set_button(Button::A, true);
        pad.set_button(Button::Start, true);
        pad.set_button(Button::Right, true);
        pad.write(1);
        pad.write(0);

        let bits: Vec<u8> = (0..8).map(|_| pad.read()).collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(pad.read(), 1);
        assert_eq!(pad.read(), 1);
    }

    #[test]
    fn strobe_high_holds_first_button() {
        let mut pad = Controller::new();
        pad.set_state(Button::A.mask());
        pad.write(1);
        assert_eq!(pad.read(), 1);
        assert_eq!(pad.read(), 1);

        pad.set_button(Button::A, false);
        assert_eq!(pad.read(), 0);
    }

    #[test]
    fn strobe_restarts_sequence() {
        let mut pad = Controller::new();
        pad.set_state(Button::B.mask());
        pad.write(0);
        assert_eq!(pad.read(), 0);
        assert_eq!(pad.read(), 1);
        pad.write(1);
        pad.write(0);
        assert_eq!(pad.read(), 0);
        assert_eq!(pad.read(), 1);
    }
}
