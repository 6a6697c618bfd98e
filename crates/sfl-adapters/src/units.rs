//! Value parsing and unit normalization for reported facts.

pub const BASE_CURRENCY: &str = "USD";
pub const SHARES_UNIT: &str = "shares";

#[derive(Debug, Clone, PartialEq)]
pub enum UnitClass {
    /// Currency unit rescaled to the base currency. `unrecognized_suffix` is
    /// set when the suffix was not in the scale table and a factor of 1 was assumed.
    Currency {
        factor: f64,
        unrecognized_suffix: Option<String>,
    },
    Shares,
    Other,
}

pub fn classify_unit(unit: &str) -> UnitClass {
    let upper = unit.trim().to_ascii_uppercase();
    if let Some(suffix) = upper.strip_prefix(BASE_CURRENCY) {
        let (factor, unrecognized_suffix) = match suffix {
            "" => (1.0, None),
            "M" | "MM" | "MN" => (1_000_000.0, None),
            "B" | "BN" => (1_000_000_000.0, None),
            "TH" | "THS" | "THOUSANDS" => (1_000.0, None),
            other => (1.0, Some(other.to_string())),
        };
        return UnitClass::Currency {
            factor,
            unrecognized_suffix,
        };
    }
    if upper == "SHARES" || upper == "SHRS" {
        return UnitClass::Shares;
    }
    UnitClass::Other
}

/// Parse a reported value. Non-numeric and non-finite values are rejected.
pub fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: f64,
    pub unit: String,
    pub unrecognized_suffix: Option<String>,
}

pub fn normalize_number(value: f64, unit: &str) -> Normalized {
    match classify_unit(unit) {
        UnitClass::Currency {
            factor,
            unrecognized_suffix,
        } => Normalized {
            value: value * factor,
            unit: BASE_CURRENCY.to_string(),
            unrecognized_suffix,
        },
        UnitClass::Shares => Normalized {
            value,
            unit: SHARES_UNIT.to_string(),
            unrecognized_suffix: None,
        },
        UnitClass::Other => Normalized {
            value,
            unit: unit.to_string(),
            unrecognized_suffix: None,
        },
    }
}

/// `None` means the entry is dropped.
pub fn normalize_value_unit(raw: &str, unit: &str) -> Option<(f64, String)> {
    let normalized = normalize_number(parse_value(raw)?, unit);
    Some((normalized.value, normalized.unit))
}
