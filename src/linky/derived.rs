use super::ChannelValue;

/// Quantities the meter does not report, computed from one frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DerivedQuantities {
    pub current: Option<f64>,
    /// Degrees
    pub phase_angle: Option<f64>,
    pub active_power: Option<f64>,
    pub reactive_power: Option<f64>,
}

pub fn compute(apparent_power: Option<f64>, voltage: Option<f64>, power_factor: Option<f64>) -> DerivedQuantities {
    let mut result = DerivedQuantities::default();

    let apparent = match apparent_power {
        Some(s) if s.is_finite() => s,
        _ => return result,
    };

    if let Some(u) = voltage {
        if u.is_finite() && u != 0.0 {
            let current = apparent / u;
            if current.is_finite() {
                result.current = Some(current);
            }
        }
    }

    if let Some(pf) = power_factor.filter(|pf| (0.0..=1.0).contains(pf)) {
        let angle = pf.acos();
        result.phase_angle = Some(angle.to_degrees());
        result.active_power = Some(apparent * pf);
        result.reactive_power = Some(apparent * angle.sin());
    }

    result
}

impl DerivedQuantities {
    pub fn channels(&self) -> Vec<(&'static str, ChannelValue)> {
        [
            ("current", self.current, "A"),
            ("phase_angle_deg", self.phase_angle, "°"),
            ("active_power", self.active_power, "W"),
            ("reactive_power", self.reactive_power, "VAr"),
        ]
        .into_iter()
        .filter_map(|(name, value, unit)| value.map(|value| (name, ChannelValue::Quantity { value, unit })))
        .collect()
    }
}
