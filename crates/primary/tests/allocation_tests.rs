use primary::allocation::{
    equal_share, fixed_budget, solar_budget, BudgetDecision, BudgetTier, SolarInput,
};

#[test]
fn equal_share_handles_empty_and_uneven_registries() {
    assert_eq!(equal_share(30, 0), None);
    assert_eq!(equal_share(30, 1), Some(30));
    assert_eq!(equal_share(30, 5), Some(6));
    assert_eq!(equal_share(32, 3), Some(10));
}

fn solar(solar_watts: f64, offset_watts: i64) -> SolarInput {
    SolarInput {
        load_watts: 0.0,
        solar_watts,
        charger_watts: 0.0,
        power_offset_watts: offset_watts,
        supply_voltage: 240,
        supply_phases: 1,
        min_amps_per_device: 6,
    }
}

#[test]
fn solar_tiers() {
    assert_eq!(
        solar_budget(&solar(2400.0, 480)),
        BudgetDecision::Charge {
            budget_amps: 12,
            tier: BudgetTier::SolarWithOffset
        }
    );
    assert_eq!(
        solar_budget(&solar(0.0, 1920)),
        BudgetDecision::Charge {
            budget_amps: 8,
            tier: BudgetTier::SolarWithOffset
        }
    );
    assert_eq!(
        solar_budget(&solar(0.0, 480)),
        BudgetDecision::Stop { shortfall_amps: 4 }
    );
}

#[test]
fn negative_offset_can_fall_back_to_stop() {
    // 10A of surplus minus a 5A reserve is still short of the minimum.
    assert_eq!(
        solar_budget(&solar(2400.0, -1200)),
        BudgetDecision::Stop { shortfall_amps: 1 }
    );
}

#[test]
fn fixed_budget_compares_against_minimum() {
    assert_eq!(
        fixed_budget(16, 6),
        BudgetDecision::Charge {
            budget_amps: 16,
            tier: BudgetTier::Fixed
        }
    );
    assert_eq!(fixed_budget(4, 6), BudgetDecision::Stop { shortfall_amps: 2 });
}
