use crate::api::{KMeansData, Problem};
use crate::devices::{select_failed, DevicePool};
use crate::error::{KMeansError, Result};
use crate::memory::DistributedBuffer;
use crate::runtime::Runtime;
use tracing::debug;

/// Deliver the canonical (last device's) centroids and assignments to the caller.
///
/// Host buffers are filled with blocking copies. Designated device buffers receive peer copies,
/// unless the canonical device is the designated device: its buffers already are the caller's.
pub(crate) fn collect<R: Runtime>(
	runtime: &R, pool: &DevicePool, problem: &Problem, centroids: &DistributedBuffer<'_, R, f32>,
	assignments: &DistributedBuffer<'_, R, u32>, data: KMeansData<'_>,
) -> Result<()> {
	let last = pool.len() - 1;
	let canonical = pool.canonical();
	match data {
		KMeansData::Host { centroids: host_centroids, assignments: host_assignments, .. } => {
			runtime.set_device(canonical).map_err(|e| select_failed(canonical, e))?;
			centroids.download(last, host_centroids)?;
			assignments.download(last, host_assignments)?;
		}
		KMeansData::Device { device, centroids: dst_centroids, assignments: dst_assignments, .. } => {
			if canonical == device {
				debug!("results already reside on device #{}", device);
			} else {
				runtime.set_device(canonical).map_err(|e| select_failed(canonical, e))?;
				runtime
					.copy_peer(dst_centroids, device, centroids.ptr(last), canonical, problem.centroids_len())
					.map_err(KMeansError::MemoryCopy)?;
				runtime
					.copy_peer(dst_assignments, device, assignments.ptr(last), canonical, problem.samples_size as usize)
					.map_err(KMeansError::MemoryCopy)?;
			}
			pool.synchronize_all(runtime)?;
		}
	}
	Ok(())
}
