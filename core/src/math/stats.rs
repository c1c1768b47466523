use crate::prelude::Sample;

pub struct StatsHelper;

impl StatsHelper {
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|&v| v * v).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// RMS magnitude of complex samples.
    pub fn complex_rms<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> f32 {
        let (sum, count) = samples
            .into_iter()
            .fold((0.0f64, 0usize), |(s, n), c| (s + c.norm_sqr() as f64, n + 1));
        if count == 0 {
            return 0.0;
        }
        (sum / count as f64).sqrt() as f32
    }

    pub fn to_db(power: f32) -> f32 {
        10.0 * power.max(f32::MIN_POSITIVE).log10()
    }

    pub fn from_db(db: f32) -> f32 {
        10f32.powf(db / 10.0)
    }

    /// Weighted mean; falls back to the plain mean when the weights vanish.
    pub fn weighted_mean(values: &[f32], weights: &[f32]) -> f32 {
        let total: f64 = weights.iter().map(|&w| w as f64).sum();
        if values.is_empty() {
            return 0.0;
        }
        if total <= 0.0 {
            return values.iter().sum::<f32>() / values.len() as f32;
        }
        let acc: f64 = values
            .iter()
            .zip(weights)
            .map(|(&v, &w)| v as f64 * w as f64)
            .sum();
        (acc / total) as f32
    }
}
