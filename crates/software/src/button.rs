//! Turns the raw level of the calibration button into discrete short and long presses.

use crate::configuration::CalibrationConfig;
use embassy_time::{Duration, Instant};

/// A classified press of the calibration button.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonEvent {
    /// The button was released before the long-press threshold.
    ShortPress,
    /// The button has been held past the long-press threshold. Reported while the button is still down.
    LongPress,
}

/// Classifies presses of a single pushbutton.
///
/// Each physical press yields exactly one [`ButtonEvent`]. A short press is reported on release, but no sooner than
/// the debounce period after the press began, which swallows contact bounce. A long press is reported as soon as the
/// threshold is crossed; releasing the button afterwards reports nothing.
#[derive(Clone, Debug)]
pub struct ButtonClassifier {
    debounce: Duration,
    long_press: Duration,
    pressed_since: Option<Instant>,
    handled: bool,
}

impl ButtonClassifier {
    /// Constructs a [`ButtonClassifier`] for a button which is currently released.
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            debounce: config.debounce,
            long_press: config.long_press,
            pressed_since: None,
            handled: false,
        }
    }

    /// Constructs a [`ButtonClassifier`] for a button which is already held down, e.g., the press that activated the
    /// calibration session at power-on. That press produces no event.
    pub fn held(config: &CalibrationConfig, now: Instant) -> Self {
        Self {
            pressed_since: Some(now),
            handled: true,
            ..Self::new(config)
        }
    }

    /// Feeds the current button level; returns the event completed by this sample, if any.
    pub fn poll(&mut self, pressed: bool, now: Instant) -> Option<ButtonEvent> {
        // a press that appears to start in the future means the clock wrapped
        if self.pressed_since.is_some_and(|since| since > now) {
            self.pressed_since = Some(now);
        }

        let held_for = match self.pressed_since {
            Some(since) => now - since,
            None if pressed => {
                self.pressed_since = Some(now);
                self.handled = false;
                Duration::from_ticks(0)
            }
            None => return None,
        };

        if !pressed && held_for >= self.debounce {
            self.pressed_since = None;
            if !self.handled {
                self.handled = true;
                return Some(ButtonEvent::ShortPress);
            }
        } else if pressed && !self.handled && held_for >= self.long_press {
            self.handled = true;
            return Some(ButtonEvent::LongPress);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Samples the button every millisecond from `from` (inclusive) to `to` (exclusive), collecting the events.
    fn drive(
        button: &mut ButtonClassifier,
        pressed: impl Fn(u64) -> bool,
        from: u64,
        to: u64,
    ) -> (usize, usize) {
        let (mut short, mut long) = (0, 0);
        for ms in from..to {
            match button.poll(pressed(ms), Instant::from_millis(ms)) {
                Some(ButtonEvent::ShortPress) => short += 1,
                Some(ButtonEvent::LongPress) => long += 1,
                None => {}
            }
        }
        (short, long)
    }

    #[test]
    fn short_press() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        let (short, long) = drive(&mut button, |ms| (1000..1100).contains(&ms), 0, 3000);
        assert_eq!((1, 0), (short, long), "Expected exactly one short press");
    }

    #[test]
    fn short_press_is_reported_after_debounce() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        assert_eq!(None, button.poll(true, Instant::from_millis(0)));
        assert_eq!(None, button.poll(false, Instant::from_millis(100)));
        assert_eq!(None, button.poll(false, Instant::from_millis(239)));
        assert_eq!(
            Some(ButtonEvent::ShortPress),
            button.poll(false, Instant::from_millis(240))
        );
        assert_eq!(None, button.poll(false, Instant::from_millis(241)));
    }

    #[test]
    fn bounce_is_a_single_press() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        // contacts chatter for the first 30 ms
        let (short, long) = drive(
            &mut button,
            |ms| ms < 30 && ms % 3 != 0 || (30..150).contains(&ms),
            0,
            1000,
        );
        assert_eq!((1, 0), (short, long), "Expected exactly one short press");
    }

    #[test]
    fn long_press() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        let (short, long) = drive(&mut button, |ms| ms < 1200, 0, 3000);
        assert_eq!((0, 1), (short, long), "Expected exactly one long press");
    }

    #[test]
    fn long_press_fires_while_held() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        let (short, long) = drive(&mut button, |_| true, 0, 999);
        assert_eq!((0, 0), (short, long));
        assert_eq!(
            Some(ButtonEvent::LongPress),
            button.poll(true, Instant::from_millis(1000))
        );
        let (short, long) = drive(&mut button, |_| true, 1001, 5000);
        assert_eq!((0, 0), (short, long), "Long press should not repeat");
    }

    #[test]
    fn startup_press_is_ignored() {
        let config = CalibrationConfig::default();
        let mut button = ButtonClassifier::held(&config, Instant::from_millis(0));
        let (short, long) = drive(&mut button, |ms| ms < 2000, 0, 3000);
        assert_eq!((0, 0), (short, long), "The activating press should be swallowed");

        let (short, long) = drive(&mut button, |ms| (3000..3100).contains(&ms), 3000, 4000);
        assert_eq!((1, 0), (short, long), "Later presses should be classified");
    }

    #[test]
    fn tolerates_clock_wrap() {
        let mut button = ButtonClassifier::new(&CalibrationConfig::default());
        assert_eq!(None, button.poll(true, Instant::from_millis(10_000)));
        // the clock restarts from a lower value while the button is held
        assert_eq!(None, button.poll(true, Instant::from_millis(5)));
        assert_eq!(None, button.poll(true, Instant::from_millis(900)));
        assert_eq!(
            Some(ButtonEvent::LongPress),
            button.poll(true, Instant::from_millis(1005))
        );
    }
}
