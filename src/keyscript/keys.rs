//! Named keyboard keys understood by key scripts.
//!
//! A [`Key`] is a physical key, not a character: `Key::A` is the same key
//! whether or not shift is held. Text is mapped onto keys by
//! [`Key::for_char`], which only knows unshifted characters.

use std::fmt;
use std::str::FromStr;

macro_rules! keys {
    ($( $variant:ident => $name:literal, $qcode:literal $(, [$($alias:literal),*])? ;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Key {
            $($variant,)*
        }

        impl Key {
            /// Canonical script name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Key::$variant => $name,)*
                }
            }

            /// QEMU `QKeyCode` name used by the input-send-event command.
            pub fn qcode(self) -> &'static str {
                match self {
                    $(Key::$variant => $qcode,)*
                }
            }

            fn lookup(name: &str) -> Option<Key> {
                match name {
                    $($name $($(| $alias)*)? => Some(Key::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

keys! {
    A => "a", "a"; B => "b", "b"; C => "c", "c"; D => "d", "d"; E => "e", "e";
    F => "f", "f"; G => "g", "g"; H => "h", "h"; I => "i", "i"; J => "j", "j";
    K => "k", "k"; L => "l", "l"; M => "m", "m"; N => "n", "n"; O => "o", "o";
    P => "p", "p"; Q => "q", "q"; R => "r", "r"; S => "s", "s"; T => "t", "t";
    U => "u", "u"; V => "v", "v"; W => "w", "w"; X => "x", "x"; Y => "y", "y";
    Z => "z", "z";
    Digit0 => "0", "0"; Digit1 => "1", "1"; Digit2 => "2", "2"; Digit3 => "3", "3";
    Digit4 => "4", "4"; Digit5 => "5", "5"; Digit6 => "6", "6"; Digit7 => "7", "7";
    Digit8 => "8", "8"; Digit9 => "9", "9";
    F1 => "f1", "f1"; F2 => "f2", "f2"; F3 => "f3", "f3"; F4 => "f4", "f4";
    F5 => "f5", "f5"; F6 => "f6", "f6"; F7 => "f7", "f7"; F8 => "f8", "f8";
    F9 => "f9", "f9"; F10 => "f10", "f10"; F11 => "f11", "f11"; F12 => "f12", "f12";
    Return => "return", "ret", ["enter"];
    Tab => "tab", "tab";
    Space => "space", "spc";
    Backspace => "backspace", "backspace";
    Delete => "delete", "delete", ["del", "forwarddelete"];
    Escape => "escape", "esc", ["esc"];
    Shift => "shift", "shift";
    RightShift => "rightshift", "shift_r";
    Ctrl => "ctrl", "ctrl", ["control"];
    RightCtrl => "rightctrl", "ctrl_r", ["rightcontrol"];
    Alt => "alt", "alt", ["option"];
    RightAlt => "rightalt", "alt_r", ["rightoption"];
    Meta => "meta", "meta_l", ["command", "cmd", "super", "win"];
    RightMeta => "rightmeta", "meta_r", ["rightcommand"];
    CapsLock => "capslock", "caps_lock";
    Up => "up", "up", ["uparrow"];
    Down => "down", "down", ["downarrow"];
    Left => "left", "left", ["leftarrow"];
    Right => "right", "right", ["rightarrow"];
    Home => "home", "home";
    End => "end", "end";
    PageUp => "pageup", "pgup";
    PageDown => "pagedown", "pgdn";
    Minus => "-", "minus", ["minus"];
    Equal => "=", "equal", ["equal"];
    LeftBracket => "[", "bracket_left", ["leftbracket"];
    RightBracket => "]", "bracket_right", ["rightbracket"];
    Backslash => "\\", "backslash", ["backslash"];
    Semicolon => ";", "semicolon", ["semicolon"];
    Quote => "'", "apostrophe", ["quote"];
    Comma => ",", "comma", ["comma"];
    Period => ".", "dot", ["period"];
    Slash => "/", "slash", ["slash"];
    Grave => "`", "grave_accent", ["grave"];
}

impl Key {
    /// The key that types `c` without modifiers, if any.
    ///
    /// Callers lowercase letters first; shifted symbols such as `!` have no
    /// mapping.
    pub fn for_char(c: char) -> Option<Key> {
        match c {
            ' ' => Some(Key::Space),
            '\n' => Some(Key::Return),
            '\t' => Some(Key::Tab),
            c if c.is_ascii_graphic() => {
                let mut buf = [0u8; 4];
                Key::lookup(c.encode_utf8(&mut buf))
            }
            _ => None,
        }
    }
}

impl FromStr for Key {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::lookup(s)
            .or_else(|| Key::lookup(&s.to_ascii_lowercase()))
            .ok_or(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One low-level key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub down: bool,
}

impl KeyEvent {
    pub fn down(key: Key) -> Self {
        Self { key, down: true }
    }

    pub fn up(key: Key) -> Self {
        Self { key, down: false }
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.down { "down" } else { "up" };
        write!(f, "{}-{arrow}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("ctrl".parse::<Key>(), Ok(Key::Ctrl));
        assert_eq!("control".parse::<Key>(), Ok(Key::Ctrl));
        assert_eq!("Option".parse::<Key>(), Ok(Key::Alt));
        assert_eq!("enter".parse::<Key>(), Ok(Key::Return));
        assert_eq!("F12".parse::<Key>(), Ok(Key::F12));
        assert_eq!("=".parse::<Key>(), Ok(Key::Equal));
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("hyper".parse::<Key>().is_err());
        assert!("".parse::<Key>().is_err());
    }

    #[test]
    fn maps_plain_characters() {
        assert_eq!(Key::for_char('a'), Some(Key::A));
        assert_eq!(Key::for_char('7'), Some(Key::Digit7));
        assert_eq!(Key::for_char(' '), Some(Key::Space));
        assert_eq!(Key::for_char('/'), Some(Key::Slash));
        assert_eq!(Key::for_char('\n'), Some(Key::Return));
    }

    #[test]
    fn shifted_symbols_are_unmapped() {
        assert_eq!(Key::for_char('!'), None);
        assert_eq!(Key::for_char('@'), None);
        assert_eq!(Key::for_char('é'), None);
    }

    #[test]
    fn qcodes_for_modifiers() {
        assert_eq!(Key::Ctrl.qcode(), "ctrl");
        assert_eq!(Key::Meta.qcode(), "meta_l");
        assert_eq!(Key::Return.qcode(), "ret");
    }
}
