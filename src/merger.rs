//! Per-meter merger
//!
//! Turns the normalized readings of one feed into candidate series: one per
//! (meter, feed, direction) that received data. Hourly readings land on their
//! own hour; 15-minute interval readings are summed into hourly buckets.

use crate::logging::{StructuredLogger, get_logger};
use crate::model::{
    CandidatePoint, CandidateSeries, Direction, FeedKind, FuelType, Meter, SeriesKey, UsageReading,
};
use crate::units::floor_to_hour;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub struct Merger {
    integration_id: String,
    logger: StructuredLogger,
}

impl Merger {
    pub fn new(integration_id: &str) -> Self {
        Self {
            integration_id: integration_id.to_string(),
            logger: get_logger("merger"),
        }
    }

    /// Candidate series for a single meter; returns them with the anomaly count
    pub fn merge_meter(
        &self,
        feed: FeedKind,
        meter: &Meter,
        readings: &[UsageReading],
    ) -> (Vec<CandidateSeries>, usize) {
        let logger = self.logger.for_service_point(&meter.service_point);
        let mut buckets: BTreeMap<Direction, BTreeMap<DateTime<Utc>, f64>> = BTreeMap::new();
        let mut anomalies = 0;

        for reading in readings {
            let direction = if reading.quantity < 0.0 || reading.flagged_return {
                Direction::Return
            } else {
                Direction::Consumption
            };

            if direction == Direction::Return {
                if meter.fuel == FuelType::Gas {
                    anomalies += 1;
                    logger.warn(&format!(
                        "AnomalyWarning: return reading on gas meter at {}, dropped",
                        reading.start
                    ));
                    continue;
                }
                if !meter.solar {
                    logger.debug(&format!(
                        "Return reading at {} on meter without solar flag",
                        reading.start
                    ));
                }
            }

            let hour = floor_to_hour(reading.start);
            let quantity = reading.quantity.abs();
            let series = buckets.entry(direction).or_default();
            match feed {
                FeedKind::Hourly => {
                    if series.contains_key(&hour) {
                        anomalies += 1;
                        logger.warn(&format!(
                            "AnomalyWarning: duplicate hourly reading at {}, dropped",
                            hour
                        ));
                        continue;
                    }
                    series.insert(hour, quantity);
                }
                FeedKind::Interval => {
                    *series.entry(hour).or_insert(0.0) += quantity;
                }
            }
        }

        let series = buckets
            .into_iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|(direction, points)| CandidateSeries {
                key: SeriesKey::new(
                    &self.integration_id,
                    &meter.service_point,
                    meter.fuel,
                    feed,
                    direction,
                ),
                unit: meter.fuel.canonical_unit(),
                points: points
                    .into_iter()
                    .map(|(start, state)| CandidatePoint { start, state })
                    .collect(),
            })
            .collect();
        (series, anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::parse_reading_timestamp as ts;

    fn meter(fuel: FuelType, solar: bool) -> Meter {
        Meter {
            service_point: "SP".into(),
            fuel,
            ami: true,
            solar,
            account_id: "A".into(),
            meter_number: None,
            premise_number: None,
        }
    }

    fn reading(t: &str, q: f64) -> UsageReading {
        UsageReading {
            service_point: "SP".into(),
            start: ts(t).unwrap(),
            quantity: q,
            flagged_return: false,
        }
    }

    #[test]
    fn test_interval_buckets_sum_into_hours() {
        let merger = Merger::new("g");
        let readings = vec![
            reading("2024-03-09T10:00:00Z", 0.25),
            reading("2024-03-09T10:15:00Z", 0.25),
            reading("2024-03-09T10:30:00Z", 0.5),
            reading("2024-03-09T10:45:00Z", -0.1),
            reading("2024-03-09T11:00:00Z", 1.0),
        ];
        let (series, anomalies) =
            merger.merge_meter(FeedKind::Interval, &meter(FuelType::Electric, true), &readings);
        assert_eq!(anomalies, 0);
        assert_eq!(series.len(), 2);

        let consumption = &series[0];
        assert_eq!(consumption.key.direction, Direction::Consumption);
        assert_eq!(consumption.points.len(), 2);
        assert!((consumption.points[0].state - 1.0).abs() < 1e-9);

        let ret = &series[1];
        assert_eq!(ret.key.direction, Direction::Return);
        assert_eq!(ret.points.len(), 1);
        assert!((ret.points[0].state - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_zero_reading_kept_as_consumption() {
        let merger = Merger::new("g");
        let (series, _) = merger.merge_meter(
            FeedKind::Hourly,
            &meter(FuelType::Electric, false),
            &[reading("2024-03-01T00:00:00Z", 0.0)],
        );
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].key.direction, Direction::Consumption);
        assert_eq!(series[0].points[0].state, 0.0);
    }

    #[test]
    fn test_duplicate_hour_dropped() {
        let merger = Merger::new("g");
        let (series, anomalies) = merger.merge_meter(
            FeedKind::Hourly,
            &meter(FuelType::Electric, false),
            &[
                reading("2024-03-01T05:00:00Z", 1.0),
                reading("2024-03-01T05:00:00Z", 7.0),
            ],
        );
        assert_eq!(anomalies, 1);
        assert_eq!(series[0].points.len(), 1);
        assert_eq!(series[0].points[0].state, 1.0);
    }

    #[test]
    fn test_gas_return_is_anomaly() {
        let merger = Merger::new("g");
        let mut flagged = reading("2024-03-01T06:00:00Z", 2.0);
        flagged.flagged_return = true;
        let (series, anomalies) = merger.merge_meter(
            FeedKind::Hourly,
            &meter(FuelType::Gas, false),
            &[reading("2024-03-01T05:00:00Z", 1.0), flagged],
        );
        assert_eq!(anomalies, 1);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].key.direction, Direction::Consumption);
        assert_eq!(series[0].unit, "CCF");
    }

    #[test]
    fn test_non_solar_return_still_routed() {
        let merger = Merger::new("g");
        let (series, anomalies) = merger.merge_meter(
            FeedKind::Hourly,
            &meter(FuelType::Electric, false),
            &[reading("2024-03-01T05:00:00Z", -3.0)],
        );
        assert_eq!(anomalies, 0);
        assert_eq!(series[0].key.direction, Direction::Return);
        assert_eq!(series[0].points[0].state, 3.0);
    }
}
