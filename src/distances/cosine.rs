use super::DistanceFunction;

/// Squared angular distance: `acos(cos(a, b))^2`.
///
/// The cosine is clamped to `[-1, 1]` to absorb rounding. A zero vector is orthogonal to everything.
pub struct CosineDistance;

impl DistanceFunction for CosineDistance {
	fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
		let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
		for (x, y) in a.iter().zip(b.iter()) {
			dot += x * y;
			na += x * x;
			nb += y * y;
		}
		let angle = if na == 0.0 || nb == 0.0 {
			std::f32::consts::FRAC_PI_2
		} else {
			(dot / (na.sqrt() * nb.sqrt())).max(-1.0).min(1.0).acos()
		};
		angle * angle
	}
}
