mod cosine;
mod euclidean;

pub use cosine::CosineDistance;
pub use euclidean::EuclideanDistance;

/// Distance between two samples of equal dimensionality.
///
/// Implementations return a squared distance, so the value can be used both to find the nearest
/// centroid and as k-means++ selection weight.
pub trait DistanceFunction: Send + Sync {
	fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

/// Index and distance of the centroid (out of the rows of `centroids`) nearest to `sample`.
///
/// Ties resolve to the lowest index.
pub(crate) fn nearest(sample: &[f32], centroids: &[f32], dist: &dyn DistanceFunction) -> (usize, f32) {
	let mut best = (0, f32::INFINITY);
	for (c, centroid) in centroids.chunks_exact(sample.len()).enumerate() {
		let d = dist.distance(sample, centroid);
		if d < best.1 || c == 0 {
			best = (c, d);
		}
	}
	best
}
