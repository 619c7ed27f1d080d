//! Centroid initialization methods, see [`InitMethod`].

pub(crate) mod import;
pub(crate) mod kmeanplusplus;
pub(crate) mod random;

use crate::api::{InitMethod, Problem};
use crate::devices::DevicePool;
use crate::error::Result;
use crate::kernels::Kernels;
use crate::memory::{DistributedBuffer, Origin};
use crate::runtime::Runtime;
use rand::RngCore;

/// Buffers an initializer works on.
///
/// `dists` and `sums` are scratch space for k-means++, usually views over buffers that are only
/// used later during the refinement.
pub(crate) struct InitBuffers<'b, 'r, R: Runtime> {
	pub samples: &'b DistributedBuffer<'r, R, f32>,
	pub centroids: &'b DistributedBuffer<'r, R, f32>,
	pub dists: &'b mut DistributedBuffer<'r, R, f32>,
	pub sums: &'b mut DistributedBuffer<'r, R, f32>,
}

/// Fill the centroids on every device of `pool` using `method`.
///
/// **imported** is only read for [`InitMethod::Import`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn initialize<R: Runtime, K: Kernels>(
	runtime: &R, kernels: &K, problem: &Problem, pool: &DevicePool, method: InitMethod, imported: Origin<'_, f32>,
	rnd: &mut dyn RngCore, buffers: InitBuffers<'_, '_, R>,
) -> Result<()> {
	match method {
		InitMethod::Import => import::calculate(pool, problem, imported, buffers.centroids),
		InitMethod::Random => random::calculate(runtime, pool, problem, rnd, buffers.samples, buffers.centroids),
		InitMethod::PlusPlus => kmeanplusplus::calculate(runtime, kernels, problem, pool, rnd, buffers),
	}
}
