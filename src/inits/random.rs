use crate::api::Problem;
use crate::devices::DevicePool;
use crate::error::{KMeansError, Result};
use crate::memory::DistributedBuffer;
use crate::runtime::Runtime;
use rand::prelude::*;
use tracing::{debug, info};

/// Indices of the samples that become the initial centroids: the first **clusters_size** entries
/// of a uniform shuffle of all sample indices.
pub(crate) fn random_centroid_indices(samples_size: u32, clusters_size: u32, rnd: &mut dyn RngCore) -> Vec<u32> {
	let mut chosen: Vec<u32> = (0..samples_size).collect();
	chosen.shuffle(rnd);
	chosen.truncate(clusters_size as usize);
	chosen
}

pub(crate) fn calculate<R: Runtime>(
	runtime: &R, pool: &DevicePool, problem: &Problem, rnd: &mut dyn RngCore,
	samples: &DistributedBuffer<'_, R, f32>, centroids: &DistributedBuffer<'_, R, f32>,
) -> Result<()> {
	info!("randomly picking initial centroids...");
	let chosen = random_centroid_indices(problem.samples_size, problem.clusters_size, rnd);
	debug!("shuffle complete, copying to device(s)");
	let f = problem.features_size as usize;
	pool.for_each(runtime, |devi, _| {
		for (c, &s) in chosen.iter().enumerate() {
			runtime
				.copy_on_device_async(centroids.ptr(devi).offset(c * f), samples.ptr(devi).offset(s as usize * f), f)
				.map_err(KMeansError::MemoryCopy)?;
		}
		Ok(())
	})
}
