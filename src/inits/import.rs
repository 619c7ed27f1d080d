use crate::api::Problem;
use crate::devices::DevicePool;
use crate::error::Result;
use crate::memory::{DistributedBuffer, Origin};
use crate::runtime::Runtime;
use tracing::debug;

/// Use the caller's centroids as they are: uploaded from the host, or peer-copied from the
/// designated device to every other device.
pub(crate) fn calculate<R: Runtime>(
	pool: &DevicePool, problem: &Problem, imported: Origin<'_, f32>, centroids: &DistributedBuffer<'_, R, f32>,
) -> Result<()> {
	debug!("importing {} centroids", problem.clusters_size);
	centroids.distribute(pool, imported, problem.centroids_len())
}
