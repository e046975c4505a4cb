use fleetguard_domain::{AttackType, ThreatSeverity};

/// Confidence floors for one attack type. `None` disables that severity.
struct SeverityBands {
    critical: Option<f64>,
    high: f64,
    medium: f64,
}

fn bands(attack_type: AttackType) -> SeverityBands {
    match attack_type {
        AttackType::Sqli => SeverityBands {
            critical: Some(0.95),
            high: 0.7,
            medium: 0.4,
        },
        AttackType::Xss => SeverityBands {
            critical: Some(0.96),
            high: 0.75,
            medium: 0.4,
        },
        AttackType::Ddos => SeverityBands {
            critical: Some(0.9),
            high: 0.7,
            medium: 0.4,
        },
        AttackType::CredentialStuffing => SeverityBands {
            critical: Some(0.9),
            high: 0.7,
            medium: 0.45,
        },
        // Behavioral drift alone never blocks.
        AttackType::Behavioral => SeverityBands {
            critical: None,
            high: 0.85,
            medium: 0.5,
        },
        AttackType::Other => SeverityBands {
            critical: None,
            high: 0.9,
            medium: 0.6,
        },
    }
}

/// Maps an attack type and degraded confidence to a severity.
#[must_use]
pub fn classify(attack_type: AttackType, confidence: f64) -> ThreatSeverity {
    let bands = bands(attack_type);

    if bands.critical.is_some_and(|floor| confidence >= floor) {
        ThreatSeverity::Critical
    } else if confidence >= bands.high {
        ThreatSeverity::High
    } else if confidence >= bands.medium {
        ThreatSeverity::Medium
    } else {
        ThreatSeverity::Low
    }
}

#[cfg(test)]
mod tests {
    use fleetguard_domain::{AttackType, ThreatSeverity};

    use super::classify;

    #[test]
    fn confident_injection_is_critical() {
        assert_eq!(classify(AttackType::Sqli, 0.97), ThreatSeverity::Critical);
        assert_eq!(classify(AttackType::Xss, 0.97), ThreatSeverity::Critical);
    }

    #[test]
    fn behavioral_is_never_critical() {
        assert_eq!(classify(AttackType::Behavioral, 1.0), ThreatSeverity::High);
    }

    #[test]
    fn weak_signals_are_low() {
        assert_eq!(classify(AttackType::Sqli, 0.2), ThreatSeverity::Low);
        assert_eq!(classify(AttackType::Ddos, 0.5), ThreatSeverity::Medium);
    }
}
