// Keyboard translation state
//
// Tracks pressed keys and the serialized modifier masks sent to clients. The
// masks come from an xkbcommon state compiled for the configured layout, the
// same keymap the engine hands to clients.

use crate::engine::Modifiers;
use std::fmt;
use xkbcommon::xkb;

/// Standard modifier masks of keymaps built from the evdev rules
pub const MOD_SHIFT: u32 = 1 << 0;
pub const MOD_LOCK: u32 = 1 << 1;
pub const MOD_CTRL: u32 = 1 << 2;
pub const MOD_ALT: u32 = 1 << 3;
pub const MOD_NUM: u32 = 1 << 4;
pub const MOD_LOGO: u32 = 1 << 6;

const RULES: &str = "evdev";
/// evdev codes sit 8 below xkb keycodes
const EVDEV_OFFSET: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeymapError {
    pub layout: String,
}

impl fmt::Display for KeymapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to compile xkb keymap for layout '{}'", self.layout)
    }
}

impl std::error::Error for KeymapError {}

pub struct KeyboardState {
    layout: String,
    state: xkb::State,
    pressed: Vec<u32>,
    modifiers: Modifiers,
}

impl KeyboardState {
    pub fn new(layout: &str) -> Result<Self, KeymapError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            RULES,
            "",
            layout,
            "",
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| KeymapError {
            layout: layout.to_string(),
        })?;

        Ok(Self {
            layout: layout.to_string(),
            state: xkb::State::new(&keymap),
            pressed: Vec::new(),
            modifiers: Modifiers::default(),
        })
    }

    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Evdev codes currently held down
    pub fn pressed_keys(&self) -> &[u32] {
        &self.pressed
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Apply a key event; returns true if the modifier state changed
    pub fn update_key(&mut self, code: u32, pressed: bool) -> bool {
        let direction = if pressed {
            if !self.pressed.contains(&code) {
                self.pressed.push(code);
            }
            xkb::KeyDirection::Down
        } else {
            self.pressed.retain(|k| *k != code);
            xkb::KeyDirection::Up
        };
        self.state.update_key((code + EVDEV_OFFSET).into(), direction);
        self.refresh()
    }

    /// Overwrite the modifier state, e.g. from host-side modifier events
    pub fn set_modifiers(&mut self, mods: Modifiers) {
        self.state
            .update_mask(mods.depressed, mods.latched, mods.locked, 0, 0, mods.group);
        self.refresh();
    }

    fn refresh(&mut self) -> bool {
        let mods = Modifiers {
            depressed: self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        };
        let changed = mods != self.modifiers;
        self.modifiers = mods;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: u32 = 30;
    const KEY_LEFTSHIFT: u32 = 42;
    const KEY_RIGHTSHIFT: u32 = 54;
    const KEY_CAPSLOCK: u32 = 58;

    #[test]
    fn test_shift_held_by_either_key() {
        let mut kb = KeyboardState::new("us").unwrap();
        assert!(kb.update_key(KEY_LEFTSHIFT, true));
        assert_eq!(kb.modifiers().depressed, MOD_SHIFT);
        assert!(!kb.update_key(KEY_A, true));
        assert_eq!(kb.pressed_keys(), &[KEY_LEFTSHIFT, KEY_A]);

        // Right shift still holds the mask
        assert!(!kb.update_key(KEY_RIGHTSHIFT, true));
        assert!(!kb.update_key(KEY_LEFTSHIFT, false));
        assert_eq!(kb.modifiers().depressed, MOD_SHIFT);
        assert!(kb.update_key(KEY_RIGHTSHIFT, false));
        assert_eq!(kb.modifiers().depressed, 0);
    }

    #[test]
    fn test_caps_lock_toggles() {
        let mut kb = KeyboardState::new("us").unwrap();
        kb.update_key(KEY_CAPSLOCK, true);
        kb.update_key(KEY_CAPSLOCK, false);
        assert_eq!(kb.modifiers().locked, MOD_LOCK);
        assert_eq!(kb.modifiers().depressed, 0);

        kb.update_key(KEY_CAPSLOCK, true);
        kb.update_key(KEY_CAPSLOCK, false);
        assert_eq!(kb.modifiers().locked, 0);
    }

    #[test]
    fn test_set_modifiers() {
        let mut kb = KeyboardState::new("us").unwrap();
        let mods = Modifiers {
            depressed: MOD_CTRL,
            latched: 0,
            locked: MOD_NUM,
            group: 0,
        };
        kb.set_modifiers(mods);
        assert_eq!(kb.modifiers(), mods);
    }

    #[test]
    fn test_other_layouts_compile() {
        let kb = KeyboardState::new("de").unwrap();
        assert_eq!(kb.layout(), "de");
    }

    #[test]
    fn test_unknown_layout_is_an_error() {
        let err = KeyboardState::new("no-such-layout").err().unwrap();
        assert_eq!(err.layout, "no-such-layout");
    }
}
