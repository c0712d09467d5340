//! The front panel: the calibration button and the 8-position switch bank.

use duo_cv_lib::calibration::PanelState;
use embassy_stm32::gpio::Input;

/// Front panel inputs. All of them are wired active-low against internal pull-ups.
pub struct Panel {
    button: Input<'static>,
    /// Switch 1 first.
    switches: [Input<'static>; 8],
}

impl Panel {
    pub fn new(button: Input<'static>, switches: [Input<'static>; 8]) -> Self {
        Self { button, switches }
    }

    /// Samples every control.
    pub fn read(&self) -> PanelState {
        let switches = self
            .switches
            .iter()
            .fold(0u8, |value, switch| (value << 1) | u8::from(switch.is_low()));
        PanelState {
            calibration_button: self.button.is_low(),
            switches,
        }
    }
}
