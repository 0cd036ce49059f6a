//! Cost accounting uses integer micro-USD to avoid float drift across
//! millions of increments. Conversion to USD happens only at serialization
//! boundaries.

const MICRO_PER_USD: f64 = 1_000_000.0;

pub fn usd_to_micro_usd(usd: f64) -> i64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * MICRO_PER_USD).round() as i64
}

pub fn micro_usd_to_usd(micro: i64) -> f64 {
    micro as f64 / MICRO_PER_USD
}
