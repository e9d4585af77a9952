//! Pink noise for the thought stream
//!
//! Expressive step handlers perturb candidate-thought salience with 1/f
//! pink noise (Voss-McCartney) rather than white noise: stable systems
//! absorb uniform noise, while 1/f perturbation keeps the stream near the
//! edge of settling. Bursts arrive on power-law step intervals, counted in
//! scheduler steps rather than wall time so seeded runs reproduce exactly.

use rand::Rng;

/// Pink noise generator using the Voss-McCartney algorithm.
///
/// Maintains one noise source per octave; octave `i` refreshes every `2^i`
/// samples, which yields the 1/f power spectrum when summed.
#[derive(Debug, Clone)]
pub struct PinkNoiseGenerator {
    octaves: usize,
    state: Vec<f32>,
    counter: u32,
}

impl Default for PinkNoiseGenerator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PinkNoiseGenerator {
    #[must_use]
    pub fn new(octaves: usize) -> Self {
        Self {
            octaves: octaves.max(1),
            state: vec![0.0; octaves.max(1)],
            counter: 0,
        }
    }

    /// Next sample in [-1, 1].
    pub fn next(&mut self, rng: &mut impl Rng) -> f32 {
        self.counter = self.counter.wrapping_add(1);
        let changed_bits = self.counter ^ self.counter.wrapping_sub(1);
        for i in 0..self.octaves {
            if changed_bits & (1 << i) != 0 {
                self.state[i] = rng.random_range(-1.0..1.0);
            }
        }
        let sum: f32 = self.state.iter().sum();
        sum / self.octaves as f32
    }

    /// Next sample scaled to a target variance.
    pub fn next_scaled(&mut self, rng: &mut impl Rng, variance: f32) -> f32 {
        self.next(rng) * variance.sqrt()
    }
}

/// Salience modulator combining pink noise with power-law burst timing.
///
/// `modulate` is called once per expressive step; bursts are scheduled a
/// power-law number of steps ahead, giving fractal inter-arrival times
/// without consulting the clock.
#[derive(Debug, Clone)]
pub struct SalienceModulator {
    pink: PinkNoiseGenerator,
    variance: f32,
    alpha: f32,
    step: u64,
    next_burst_step: u64,
}

impl Default for SalienceModulator {
    fn default() -> Self {
        Self {
            pink: PinkNoiseGenerator::default(),
            variance: 0.05,
            alpha: 1.2,
            step: 0,
            next_burst_step: 1,
        }
    }
}

impl SalienceModulator {
    #[must_use]
    pub fn with_variance(variance: f32) -> Self {
        Self {
            variance,
            ..Self::default()
        }
    }

    /// Power-law sampled step gap: `k = (1 - u)^(-1 / (alpha - 1))`, capped.
    fn sample_gap(&self, rng: &mut impl Rng) -> u64 {
        let u: f32 = rng.random();
        let k = (1.0 - u + f32::EPSILON).powf(-1.0 / (self.alpha - 1.0));
        (k.min(100.0).max(1.0)) as u64
    }

    /// Whether this step is a burst, advancing the burst schedule.
    pub fn check_burst(&mut self, rng: &mut impl Rng) -> bool {
        self.step += 1;
        if self.step >= self.next_burst_step {
            self.next_burst_step = self.step + self.sample_gap(rng);
            true
        } else {
            false
        }
    }

    /// Modulate a base salience with pink noise and burst elevation,
    /// clamped to [0,1].
    pub fn modulate(&mut self, rng: &mut impl Rng, base: f32) -> f32 {
        let noise = self.pink.next_scaled(rng, self.variance);
        if self.check_burst(rng) {
            (base + 0.4 + noise).clamp(0.0, 1.0)
        } else {
            (base + noise).clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn pink_noise_stays_in_range() {
        let mut pink = PinkNoiseGenerator::new(8);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let sample = pink.next(&mut rng);
            assert!((-1.0..=1.0).contains(&sample));
        }
    }

    #[test]
    fn pink_noise_has_positive_autocorrelation() {
        let mut pink = PinkNoiseGenerator::new(8);
        let mut rng = StdRng::seed_from_u64(2);
        let samples: Vec<f32> = (0..2000).map(|_| pink.next(&mut rng)).collect();

        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        let variance: f32 =
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        let autocorr: f32 = samples
            .windows(2)
            .map(|w| (w[0] - mean) * (w[1] - mean))
            .sum::<f32>()
            / (samples.len() - 1) as f32
            / variance;

        assert!(autocorr > 0.0, "pink noise autocorrelation {autocorr}");
    }

    #[test]
    fn modulation_is_clamped_and_varied() {
        let mut modulator = SalienceModulator::default();
        let mut rng = StdRng::seed_from_u64(3);
        let values: Vec<f32> = (0..200).map(|_| modulator.modulate(&mut rng, 0.5)).collect();
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!(min >= 0.0 && max <= 1.0);
        assert!(max > min);
    }

    #[test]
    fn seeded_runs_reproduce() {
        let run = |seed| {
            let mut modulator = SalienceModulator::default();
            let mut rng = StdRng::seed_from_u64(seed);
            (0..100)
                .map(|_| modulator.modulate(&mut rng, 0.4))
                .collect::<Vec<f32>>()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    #[test]
    fn burst_gaps_follow_schedule() {
        let mut modulator = SalienceModulator::default();
        let mut rng = StdRng::seed_from_u64(4);
        let mut bursts = 0;
        for _ in 0..500 {
            if modulator.check_burst(&mut rng) {
                bursts += 1;
            }
        }
        assert!(bursts > 0, "bursts eventually fire");
        assert!(bursts < 500, "not every step is a burst");
    }
}
