//! Wire types of the account API (JSON, camelCase)

use crate::model::FuelType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAccount {
    pub account_number: String,
    #[serde(default)]
    pub company_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeter {
    pub service_point_number: String,
    /// "Electric" or "Gas"
    pub fuel_type: String,
    #[serde(default)]
    pub has_ami_smart_meter: bool,
    #[serde(default)]
    pub has_solar: bool,
    #[serde(default)]
    pub meter_number: Option<String>,
    #[serde(default)]
    pub premise_number: Option<String>,
}

impl RawMeter {
    pub fn fuel(&self) -> Option<FuelType> {
        parse_fuel(&self.fuel_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBilling {
    /// `YYYY-MM-DD`
    pub start_date: String,
    /// `YYYY-MM-DD`
    pub end_date: String,
    pub usage: f64,
    pub units: String,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUsageCost {
    pub fuel_type: String,
    /// First day of the month, `YYYY-MM-DD`
    pub date: String,
    pub quantity: f64,
    pub units: String,
    #[serde(default)]
    pub cost: f64,
}

/// One hourly or 15-minute reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    pub start_time: String,
    /// Negative for energy returned to the grid
    pub value: f64,
    pub units: String,
    #[serde(default)]
    pub is_return: bool,
}

pub fn parse_fuel(raw: &str) -> Option<FuelType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "electric" | "electricity" => Some(FuelType::Electric),
        "gas" | "natural gas" => Some(FuelType::Gas),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_decodes_camel_case() {
        let json = r#"{"servicePointNumber":"77","fuelType":"Gas","hasAmiSmartMeter":true}"#;
        let meter: RawMeter = serde_json::from_str(json).unwrap();
        assert_eq!(meter.service_point_number, "77");
        assert_eq!(meter.fuel(), Some(FuelType::Gas));
        assert!(meter.has_ami_smart_meter);
        assert!(!meter.has_solar);
        assert!(meter.meter_number.is_none());
    }

    #[test]
    fn test_reading_return_flag_defaults_false() {
        let json = r#"{"startTime":"2024-03-01 13:00:00","value":-0.4,"units":"KWH"}"#;
        let reading: RawReading = serde_json::from_str(json).unwrap();
        assert!(!reading.is_return);
        assert_eq!(reading.value, -0.4);
    }

    #[test]
    fn test_parse_fuel() {
        assert_eq!(parse_fuel("Electric"), Some(FuelType::Electric));
        assert_eq!(parse_fuel("GAS"), Some(FuelType::Gas));
        assert_eq!(parse_fuel("water"), None);
    }
}
