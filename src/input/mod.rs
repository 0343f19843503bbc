//! Synthetic keyboard input for the AUT.
//!
//! Injection is blind and focus-following: keys go to whatever window holds
//! focus, and nothing confirms delivery. The controller's fixed waits are the
//! only synchronisation.

use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Characters typed with shift held, paired with their unshifted key on a US
/// layout.
const SHIFTED: &[(char, char)] = &[
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    (':', ';'),
    ('"', '\''),
    ('?', '/'),
    ('<', ','),
    ('>', '.'),
    ('{', '['),
    ('}', ']'),
    ('|', '\\'),
    ('~', '`'),
];

/// Unshifted punctuation keys and their X keysym names.
const PUNCTUATION: &[(char, &str)] = &[
    ('/', "slash"),
    ('-', "minus"),
    ('=', "equal"),
    ('.', "period"),
    (',', "comma"),
    (';', "semicolon"),
    ('\'', "apostrophe"),
    ('[', "bracketleft"),
    (']', "bracketright"),
    ('\\', "backslash"),
    ('`', "grave"),
];

/// One physical key.
///
/// `Char` only ever holds an unshifted character: a lowercase ASCII letter, a
/// digit, or one of the unshifted punctuation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Space,
    Shift,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    Char(char),
}

#[derive(Debug, thiserror::Error)]
#[error("unknown key name '{0}'")]
pub struct ParseKeyError(String);

impl Key {
    /// Key (and whether shift must be held) that types `c`, or `None` when
    /// the character has no mapping.
    pub fn for_char(c: char) -> Option<(Key, bool)> {
        match c {
            ' ' => Some((Key::Space, false)),
            '\n' => Some((Key::Enter, false)),
            '\t' => Some((Key::Tab, false)),
            'a'..='z' | '0'..='9' => Some((Key::Char(c), false)),
            'A'..='Z' => Some((Key::Char(c.to_ascii_lowercase()), true)),
            _ if PUNCTUATION.iter().any(|(p, _)| *p == c) => Some((Key::Char(c), false)),
            _ => SHIFTED
                .iter()
                .find(|(shifted, _)| *shifted == c)
                .map(|(_, base)| (Key::Char(*base), true)),
        }
    }

    /// The character produced by this key, shifted or not.
    pub fn produces(self, shift: bool) -> Option<char> {
        match self {
            Key::Space => Some(' '),
            Key::Enter => Some('\n'),
            Key::Tab => Some('\t'),
            Key::Char(c) if !shift => Some(c),
            Key::Char(c) if c.is_ascii_lowercase() => Some(c.to_ascii_uppercase()),
            Key::Char(c) => SHIFTED
                .iter()
                .find(|(_, base)| *base == c)
                .map(|(shifted, _)| *shifted),
            _ => None,
        }
    }

    /// X keysym name understood by `xdotool`.
    pub fn keysym(self) -> String {
        match self {
            Key::Enter => "Return".to_string(),
            Key::Tab => "Tab".to_string(),
            Key::Escape => "Escape".to_string(),
            Key::Space => "space".to_string(),
            Key::Shift => "shift".to_string(),
            Key::Backspace => "BackSpace".to_string(),
            Key::Up => "Up".to_string(),
            Key::Down => "Down".to_string(),
            Key::Left => "Left".to_string(),
            Key::Right => "Right".to_string(),
            Key::Char(c) => PUNCTUATION
                .iter()
                .find(|(p, _)| *p == c)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_else(|| c.to_string()),
        }
    }

    fn name(self) -> String {
        match self {
            Key::Enter => "enter".to_string(),
            Key::Tab => "tab".to_string(),
            Key::Escape => "escape".to_string(),
            Key::Space => "space".to_string(),
            Key::Shift => "shift".to_string(),
            Key::Backspace => "backspace".to_string(),
            Key::Up => "up".to_string(),
            Key::Down => "down".to_string(),
            Key::Left => "left".to_string(),
            Key::Right => "right".to_string(),
            Key::Char(c) => c.to_string(),
        }
    }
}

impl FromStr for Key {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => Key::Enter,
            "tab" => Key::Tab,
            "escape" | "esc" => Key::Escape,
            "space" => Key::Space,
            "shift" => Key::Shift,
            "backspace" => Key::Backspace,
            "up" => Key::Up,
            "down" => Key::Down,
            "left" => Key::Left,
            "right" => Key::Right,
            _ => {
                let mut chars = s.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => match Key::for_char(c) {
                        Some((key, false)) => key,
                        _ => return Err(ParseKeyError(s.to_string())),
                    },
                    _ => return Err(ParseKeyError(s.to_string())),
                }
            }
        };
        Ok(key)
    }
}

impl TryFrom<String> for Key {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.name()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Low-level key event sink.
pub trait KeyInjector: Send {
    fn name(&self) -> &'static str;
    fn press(&mut self, key: Key) -> Result<()>;
    fn release(&mut self, key: Key) -> Result<()>;
}

/// Which injector the run uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputBackend {
    #[default]
    Xdotool,
    None,
}

impl InputBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            InputBackend::Xdotool => "xdotool",
            InputBackend::None => "none",
        }
    }

    pub fn injector(self) -> Result<Box<dyn KeyInjector>> {
        Ok(match self {
            InputBackend::Xdotool => Box::new(XdotoolInjector::new()?),
            InputBackend::None => Box::new(NullInjector),
        })
    }
}

/// Injects keys into the focused X window via `xdotool`.
#[derive(Debug)]
pub struct XdotoolInjector;

impl XdotoolInjector {
    /// Verify that `xdotool` is available.
    pub fn new() -> Result<Self> {
        let output = Command::new("xdotool")
            .arg("version")
            .output()
            .context("xdotool not found; install it (e.g., `apt install xdotool`) or use --no-input")?;

        if !output.status.success() {
            bail!(
                "xdotool version failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(version = %version, "xdotool found");
        Ok(Self)
    }

    fn run(&self, action: &str, key: Key) -> Result<()> {
        let keysym = key.keysym();
        let output = Command::new("xdotool")
            .args([action, keysym.as_str()])
            .output()
            .with_context(|| format!("failed to run xdotool {action} {keysym}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("xdotool {action} {keysym} failed: {stderr}");
        }
        Ok(())
    }
}

impl KeyInjector for XdotoolInjector {
    fn name(&self) -> &'static str {
        "xdotool"
    }

    fn press(&mut self, key: Key) -> Result<()> {
        self.run("keydown", key)
    }

    fn release(&mut self, key: Key) -> Result<()> {
        self.run("keyup", key)
    }
}

/// Discards every event. For headless dry runs.
#[derive(Debug, Default)]
pub struct NullInjector;

impl KeyInjector for NullInjector {
    fn name(&self) -> &'static str {
        "none"
    }

    fn press(&mut self, key: Key) -> Result<()> {
        trace!(key = %key, "press (discarded)");
        Ok(())
    }

    fn release(&mut self, key: Key) -> Result<()> {
        trace!(key = %key, "release (discarded)");
        Ok(())
    }
}

/// Sends keys and literal text through a [`KeyInjector`].
pub struct InputDriver {
    injector: Box<dyn KeyInjector>,
    key_delay: Duration,
}

impl InputDriver {
    pub fn new(injector: Box<dyn KeyInjector>, key_delay: Duration) -> Self {
        Self {
            injector,
            key_delay,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.injector.name()
    }

    /// Press and release one key.
    pub fn send_key(&mut self, key: Key) -> Result<()> {
        debug!(key = %key, "sending key");
        self.tap(key)
    }

    /// Type `text`, wrapping shifted characters in a shift press. Characters
    /// with no key are skipped. Returns how many characters were typed.
    pub fn send_text(&mut self, text: &str) -> Result<usize> {
        debug!(text = %text, "typing text");
        let mut typed = 0;
        for c in text.chars() {
            let Some((key, shift)) = Key::for_char(c) else {
                debug!(char = ?c, "no key for character; skipping");
                continue;
            };
            if shift {
                self.injector.press(Key::Shift)?;
                let tapped = self.tap(key);
                let released = self.injector.release(Key::Shift);
                tapped?;
                released?;
            } else {
                self.tap(key)?;
            }
            typed += 1;
        }
        Ok(typed)
    }

    fn tap(&mut self, key: Key) -> Result<()> {
        self.injector.press(key)?;
        self.pause();
        self.injector.release(key)?;
        self.pause();
        Ok(())
    }

    fn pause(&self) {
        if !self.key_delay.is_zero() {
            thread::sleep(self.key_delay);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum KeyEvent {
        Press(Key),
        Release(Key),
    }

    /// Records every event; clones share the record.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingInjector {
        events: Arc<Mutex<Vec<KeyEvent>>>,
    }

    impl RecordingInjector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<KeyEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Reconstruct the characters the recorded presses would type.
        pub fn typed_text(&self) -> String {
            let mut shift = false;
            let mut out = String::new();
            for event in self.events() {
                match event {
                    KeyEvent::Press(Key::Shift) => shift = true,
                    KeyEvent::Release(Key::Shift) => shift = false,
                    KeyEvent::Press(key) => {
                        if let Some(c) = key.produces(shift) {
                            out.push(c);
                        }
                    }
                    KeyEvent::Release(_) => {}
                }
            }
            out
        }
    }

    impl KeyInjector for RecordingInjector {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn press(&mut self, key: Key) -> Result<()> {
            self.events.lock().unwrap().push(KeyEvent::Press(key));
            Ok(())
        }

        fn release(&mut self, key: Key) -> Result<()> {
            self.events.lock().unwrap().push(KeyEvent::Release(key));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{KeyEvent, RecordingInjector};
    use super::*;

    fn driver() -> (InputDriver, RecordingInjector) {
        let recorder = RecordingInjector::new();
        let driver = InputDriver::new(Box::new(recorder.clone()), Duration::ZERO);
        (driver, recorder)
    }

    struct FailingInjector;

    impl KeyInjector for FailingInjector {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn press(&mut self, _key: Key) -> Result<()> {
            bail!("display unavailable")
        }
        fn release(&mut self, _key: Key) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn send_key_presses_then_releases() {
        let (mut driver, recorder) = driver();
        driver.send_key(Key::Tab).unwrap();
        assert_eq!(
            recorder.events(),
            vec![KeyEvent::Press(Key::Tab), KeyEvent::Release(Key::Tab)]
        );
    }

    #[test]
    fn send_text_types_command() {
        let (mut driver, recorder) = driver();
        assert_eq!(driver.send_text("/runalltests").unwrap(), 12);
        assert_eq!(recorder.typed_text(), "/runalltests");
        assert_eq!(recorder.events()[0], KeyEvent::Press(Key::Char('/')));
    }

    #[test]
    fn uppercase_is_wrapped_in_shift() {
        let (mut driver, recorder) = driver();
        driver.send_text("Go").unwrap();
        assert_eq!(
            recorder.events(),
            vec![
                KeyEvent::Press(Key::Shift),
                KeyEvent::Press(Key::Char('g')),
                KeyEvent::Release(Key::Char('g')),
                KeyEvent::Release(Key::Shift),
                KeyEvent::Press(Key::Char('o')),
                KeyEvent::Release(Key::Char('o')),
            ]
        );
        assert_eq!(recorder.typed_text(), "Go");
    }

    #[test]
    fn shifted_symbols_round_trip() {
        let (mut driver, recorder) = driver();
        driver.send_text("say @a: Hi!").unwrap();
        assert_eq!(recorder.typed_text(), "say @a: Hi!");
    }

    #[test]
    fn unmapped_characters_are_skipped() {
        let (mut driver, recorder) = driver();
        assert_eq!(driver.send_text("ok✅é").unwrap(), 2);
        assert_eq!(recorder.typed_text(), "ok");
    }

    #[test]
    fn injector_error_propagates() {
        let mut driver = InputDriver::new(Box::new(FailingInjector), Duration::ZERO);
        let err = driver.send_key(Key::Enter).unwrap_err();
        assert!(err.to_string().contains("display unavailable"));
        assert!(driver.send_text("x").is_err());
    }

    #[test]
    fn key_names_parse() {
        assert_eq!("Enter".parse::<Key>().unwrap(), Key::Enter);
        assert_eq!("return".parse::<Key>().unwrap(), Key::Enter);
        assert_eq!("esc".parse::<Key>().unwrap(), Key::Escape);
        assert_eq!("t".parse::<Key>().unwrap(), Key::Char('t'));
        assert_eq!("/".parse::<Key>().unwrap(), Key::Char('/'));
        assert!("T".parse::<Key>().is_err());
        assert!("hyper".parse::<Key>().is_err());
        assert!("".parse::<Key>().is_err());
    }

    #[test]
    fn keysyms_match_xdotool_names() {
        assert_eq!(Key::Enter.keysym(), "Return");
        assert_eq!(Key::Space.keysym(), "space");
        assert_eq!(Key::Char('/').keysym(), "slash");
        assert_eq!(Key::Char('t').keysym(), "t");
        assert_eq!(Key::Backspace.keysym(), "BackSpace");
    }

    #[test]
    fn key_serde_uses_names() {
        #[derive(Deserialize, Serialize)]
        struct Step {
            key: Key,
        }
        let step: Step = toml::from_str(r#"key = "tab""#).unwrap();
        assert_eq!(step.key, Key::Tab);
        assert_eq!(serde_json::to_string(&step).unwrap(), r#"{"key":"tab"}"#);
        assert!(toml::from_str::<Step>(r#"key = "nope""#).is_err());
    }

    #[test]
    fn backend_names() {
        #[derive(Deserialize)]
        struct Input {
            backend: InputBackend,
        }
        let input: Input = toml::from_str(r#"backend = "none""#).unwrap();
        assert_eq!(input.backend, InputBackend::None);
        assert!(toml::from_str::<Input>(r#"backend = "robot""#).is_err());
        assert_eq!(InputBackend::default().as_str(), "xdotool");
    }

    #[test]
    fn null_backend_builds_without_tools() {
        let injector = InputBackend::None.injector().unwrap();
        assert_eq!(injector.name(), "none");
    }
}
