//! Values computed from raw readings rather than read from an instrument.

use crate::snapshot::{round2, Reading};

/// Thermocouple readings above this are an open junction, not a temperature.
pub const THERMOCOUPLE_LIMIT: f64 = 1450.0;

/// Cathode temperature in Kelvin from its supply voltage and current.
///
/// The cathode resistance `R = V / I` scaled by the calibration constant `k` gives the
/// resistivity `rho`, and `T = 0.084 rho^2 + 17.56 rho + 62.557`. A zero voltage or
/// current means the cathode is not heated and yields 0.
pub fn cathode_temperature(voltage: f64, current: f64, k: f64) -> f64 {
    if voltage == 0.0 || current == 0.0 {
        return 0.0;
    }
    let rho = voltage / current * k;
    round2(0.084 * rho * rho + 17.56 * rho + 62.557)
}

/// `T_cathode` reading; valid only when both inputs are.
pub fn cathode_reading(voltage: Reading, current: Reading, k: f64) -> Reading {
    Reading {
        value: cathode_temperature(voltage.value, current.value, k),
        valid: voltage.valid && current.valid,
    }
}

/// Replace open-junction and non-numeric readings with the fallback and round the rest.
pub fn clamp_thermocouple(raw: Reading) -> Reading {
    if !raw.value.is_finite() || raw.value > THERMOCOUPLE_LIMIT {
        return Reading::fallback();
    }
    Reading {
        value: round2(raw.value),
        valid: raw.valid,
    }
}
