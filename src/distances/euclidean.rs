use super::DistanceFunction;

/// Squared euclidean distance.
pub struct EuclideanDistance;

impl DistanceFunction for EuclideanDistance {
	#[inline(always)]
	fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
		a.iter()
			.zip(b.iter())
			.map(|(sp, cp)| sp - cp)
			.map(|v| v * v)
			.sum()
	}
}
