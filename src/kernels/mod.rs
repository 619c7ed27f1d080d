//! Compute kernels the orchestration layer drives.
//!
//! The [`Kernels`] trait is the seam between the orchestration (buffers, devices, initialization,
//! result collection) and the actual per-device number crunching. [`HostKernels`] implements it by
//! staging each device's partition to the host and computing it there with rayon.

mod host;

pub use host::HostKernels;

use crate::api::Problem;
use crate::devices::DevicePool;
use crate::error::Result;
use crate::memory::DistributedBuffer;
use crate::runtime::Runtime;
use crate::variants::YinyangBuffers;

/// The buffers the refinement reads and updates in place, all replicated over the pool.
pub struct RefineBuffers<'b, 'r, R: Runtime> {
	/// `samples_size * features_size`, read only
	pub samples: &'b DistributedBuffer<'r, R, f32>,
	/// `clusters_size * features_size`, holds the initial centroids on entry and the final ones on return
	pub centroids: &'b mut DistributedBuffer<'r, R, f32>,
	/// `clusters_size`, amount of samples per cluster
	pub counts: &'b mut DistributedBuffer<'r, R, u32>,
	/// `samples_size`, assignments of the previous iteration
	pub prev_assignments: &'b mut DistributedBuffer<'r, R, u32>,
	/// `samples_size`
	pub assignments: &'b mut DistributedBuffer<'r, R, u32>,
	/// Group scratch buffers, `None` when yinyang grouping is disabled.
	pub yinyang: Option<&'b mut YinyangBuffers<'r, R>>,
}

pub trait Kernels {
	/// Prepare the kernels for `problem` on every device of `pool`.
	/// Has to be called before any of the other operations.
	fn setup<R: Runtime>(&self, runtime: &R, problem: &Problem, pool: &DevicePool) -> Result<()>;

	/// One k-means++ step: for every sample, the squared distance to its nearest centroid out of the
	/// first **centroids_so_far** rows of **centroids**.
	///
	/// Each device handles its own partition of the samples, writes the distances of it into **dists**
	/// and its partial sum to the first element of **sums**. The distances of all partitions are also
	/// gathered into **host_dists** (length `samples_size`).
	/// ## Returns
	/// The sum of all distances
	#[allow(clippy::too_many_arguments)]
	fn plus_plus_step<R: Runtime>(
		&self, runtime: &R, problem: &Problem, centroids_so_far: u32, pool: &DevicePool,
		samples: &DistributedBuffer<'_, R, f32>, centroids: &DistributedBuffer<'_, R, f32>,
		dists: &mut DistributedBuffer<'_, R, f32>, sums: &mut DistributedBuffer<'_, R, f32>, host_dists: &mut [f32],
	) -> Result<f32>;

	/// Run the yinyang refinement until the reassignment threshold derived from **tolerance** is met.
	///
	/// On return, centroids, counts and assignments hold the final results on every device.
	fn yinyang<R: Runtime>(
		&self, runtime: &R, problem: &Problem, tolerance: f32, pool: &DevicePool, buffers: RefineBuffers<'_, '_, R>,
	) -> Result<()>;
}
