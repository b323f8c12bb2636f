//! Power budgeting: watt/amp conversion, equal sharing and the solar tiers.

/// Volts used for conversions: per phase, tripled on a three phase supply.
pub fn supply_volts(voltage: u16, phases: u8) -> i64 {
    if phases == 3 {
        i64::from(voltage) * 3
    } else {
        i64::from(voltage)
    }
}

/// Whole amps available from `watts`, rounding the watts half-to-even first.
pub fn watts_to_amps(watts: f64, voltage: u16, phases: u8) -> i64 {
    (watts.round_ties_even() as i64) / supply_volts(voltage, phases)
}

pub fn amps_to_watts(amps: i64, voltage: u16, phases: u8) -> i64 {
    amps * supply_volts(voltage, phases)
}

/// Equal share of `total_amps` across `device_count` secondaries.
pub fn equal_share(total_amps: u16, device_count: usize) -> Option<u16> {
    if device_count == 0 {
        return None;
    }
    let count = u32::try_from(device_count).unwrap_or(u32::MAX);
    Some((u32::from(total_amps) / count) as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetTier {
    /// Solar surplus plus the configured offset covers the minimum.
    SolarWithOffset,
    /// Only the offset covers the minimum.
    OffsetOnly,
    /// Solar tracking disabled; the configured budget covers the minimum.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Apply `budget_amps` and let stopped vehicles start.
    Charge { budget_amps: i64, tier: BudgetTier },
    /// Not enough power for the minimum; leave the budget and stop vehicles.
    Stop { shortfall_amps: i64 },
}

/// Inputs of one solar-aware budget recompute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarInput {
    pub load_watts: f64,
    pub solar_watts: f64,
    /// What the chargers themselves are drawing right now.
    pub charger_watts: f64,
    pub power_offset_watts: i64,
    pub supply_voltage: u16,
    pub supply_phases: u8,
    pub min_amps_per_device: u16,
}

impl SolarInput {
    /// Site load minus the chargers' own draw, when the meter includes it.
    pub fn non_charger_load(&self) -> f64 {
        if self.load_watts > self.charger_watts {
            self.load_watts - self.charger_watts
        } else {
            self.load_watts
        }
    }

    /// Solar surplus over the non-charger load, never negative.
    pub fn surplus_watts(&self) -> f64 {
        (self.solar_watts - self.non_charger_load()).max(0.0)
    }

    pub fn solar_amps(&self) -> i64 {
        watts_to_amps(self.surplus_watts(), self.supply_voltage, self.supply_phases)
    }

    pub fn offset_amps(&self) -> i64 {
        watts_to_amps(
            self.power_offset_watts as f64,
            self.supply_voltage,
            self.supply_phases,
        )
    }
}

pub fn solar_budget(input: &SolarInput) -> BudgetDecision {
    let solar_amps = input.solar_amps();
    let offset_amps = input.offset_amps();
    let minimum = i64::from(input.min_amps_per_device);

    if solar_amps + offset_amps >= minimum {
        BudgetDecision::Charge {
            budget_amps: solar_amps + offset_amps,
            tier: BudgetTier::SolarWithOffset,
        }
    } else if offset_amps >= minimum {
        BudgetDecision::Charge {
            budget_amps: offset_amps,
            tier: BudgetTier::OffsetOnly,
        }
    } else {
        BudgetDecision::Stop {
            shortfall_amps: minimum - (solar_amps + offset_amps),
        }
    }
}

pub fn fixed_budget(available_amps: u16, min_amps_per_device: u16) -> BudgetDecision {
    if available_amps >= min_amps_per_device {
        BudgetDecision::Charge {
            budget_amps: i64::from(available_amps),
            tier: BudgetTier::Fixed,
        }
    } else {
        BudgetDecision::Stop {
            shortfall_amps: i64::from(min_amps_per_device - available_amps),
        }
    }
}
