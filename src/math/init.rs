use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::math::tensor::Tensor;

/// Strategy used to fill freshly allocated weights and biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    /// Uniform samples from `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Xavier (Glorot): N(0, sqrt(1 / fan_in)). Suits sigmoid/tanh/identity.
    Xavier,
    /// He: N(0, sqrt(2 / fan_in)). Suits ReLU.
    He,
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Uniform { low: -0.5, high: 0.5 }
    }
}

impl Initializer {
    /// Fills `tensor` in place. `fan_in` is the number of inputs feeding each output.
    pub fn fill<R: Rng + ?Sized>(&self, tensor: &Tensor, fan_in: usize, rng: &mut R) {
        let fan_in = fan_in.max(1) as f64;
        let mut values = tensor.data_mut();
        match *self {
            Initializer::Zeros => values.iter_mut().for_each(|x| *x = 0.0),
            Initializer::Uniform { low, high } => {
                for x in values.iter_mut() {
                    *x = low + rng.gen::<f64>() * (high - low);
                }
            }
            Initializer::Xavier => {
                let std_dev = (1.0 / fan_in).sqrt();
                for x in values.iter_mut() {
                    *x = sample_standard_normal(rng) * std_dev;
                }
            }
            Initializer::He => {
                let std_dev = (2.0 / fan_in).sqrt();
                for x in values.iter_mut() {
                    *x = sample_standard_normal(rng) * std_dev;
                }
            }
        }
    }
}

/// Samples a single value from N(0, 1) using the Box-Muller transform.
fn sample_standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // Both samples in (0, 1] to avoid log(0).
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = 1.0 - rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_range() {
        let t = Tensor::zeros(&[100]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        Initializer::Uniform { low: -0.1, high: 0.1 }.fill(&t, 10, &mut rng);
        assert!(t.to_vec().iter().all(|&x| (-0.1..0.1).contains(&x)));
        assert!(t.to_vec().iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_seeded_fill_is_reproducible() {
        let a = Tensor::zeros(&[16]).unwrap();
        let b = Tensor::zeros(&[16]).unwrap();
        Initializer::He.fill(&a, 4, &mut StdRng::seed_from_u64(42));
        Initializer::He.fill(&b, 4, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_xavier_spread_shrinks_with_fan_in() {
        let narrow = Tensor::zeros(&[2000]).unwrap();
        let wide = Tensor::zeros(&[2000]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        Initializer::Xavier.fill(&narrow, 1, &mut rng);
        Initializer::Xavier.fill(&wide, 100, &mut rng);
        let var = |t: &Tensor| t.to_vec().iter().map(|x| x * x).sum::<f64>() / t.len() as f64;
        assert!(var(&wide) < var(&narrow));
    }
}
