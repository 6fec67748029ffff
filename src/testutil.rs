//! Deterministic synthetic histories for unit tests.

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::models::Measurement;

// ---

/// Hourly series of `hours` samples ending at `end`.
///
/// pm25 at sample `t + 24` is `10 + 2 * temperature[t]` plus small noise, so
/// a model that sees today's temperature can forecast tomorrow's pm25.
pub fn synthetic_series(city: &str, end: DateTime<Utc>, hours: usize, seed: u64) -> Vec<Measurement> {
    // ---
    let mut rng = StdRng::seed_from_u64(seed);
    let drivers: Vec<f64> = (0..hours + 24)
        .map(|_| rng.gen_range(0.0..30.0))
        .collect();

    (0..hours)
        .map(|t| {
            let pm25 = 10.0 + 2.0 * drivers[t] + rng.gen_range(-1.0..1.0);
            Measurement {
                timestamp: end - Duration::hours((hours - 1 - t) as i64),
                city: city.to_string(),
                sensor_id: None,
                pm25,
                pm10: pm25 * 1.5 + rng.gen_range(0.0..2.0),
                no2: 20.0 + rng.gen_range(0.0..5.0),
                temperature: drivers[t + 24],
                humidity: rng.gen_range(40.0..80.0),
                wind_speed: rng.gen_range(0.0..10.0),
                pressure: rng.gen_range(1000.0..1025.0),
            }
        })
        .collect()
}
