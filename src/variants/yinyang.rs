use crate::api::{KMeans, KMeansConfig, KMeansData, Problem};
use crate::convergence::reassignments_threshold;
use crate::devices::DevicePool;
use crate::error::Result;
use crate::helpers::max_distribute_length;
use crate::inits::{self, InitBuffers};
use crate::kernels::{Kernels, RefineBuffers};
use crate::memory::DistributedBuffer;
use crate::results;
use crate::runtime::Runtime;
use crate::validation::check_args;
use rand::prelude::*;
use tracing::{debug, info};

/// Element counts of the yinyang scratch buffers, per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YinyangSizes {
	/// Longest sample partition of any device
	pub max_length: usize,
	pub bounds: usize,
	pub drifts: usize,
	pub passed: usize,
	pub group_centroids: usize,
}
impl YinyangSizes {
	pub fn new(problem: &Problem, pool: &DevicePool) -> Self {
		let groups = problem.yinyang_groups as usize;
		let max_length = max_distribute_length(problem.samples_size as usize, pool.len());
		Self {
			max_length,
			bounds: max_length * (groups + 1),
			drifts: problem.centroids_len() + problem.clusters_size as usize,
			passed: max_length.max(problem.clusters_size as usize + groups),
			group_centroids: groups * problem.features_size as usize,
		}
	}

	/// Whether the group centroids fit into the memory of `passed`.
	pub fn reuses_passed(&self) -> bool {
		self.group_centroids <= self.passed
	}
}

/// Scratch buffers of the yinyang refinement.
pub struct YinyangBuffers<'r, R: Runtime> {
	/// `clusters_size`, group of every centroid
	pub group_assignments: DistributedBuffer<'r, R, u32>,
	/// `groups * features_size`
	pub group_centroids: DistributedBuffer<'r, R, f32>,
	/// Per sample of the local partition: upper bound followed by one lower bound per group
	pub bounds: DistributedBuffer<'r, R, f32>,
	/// Updated centroids followed by the drift of every centroid
	pub drifts: DistributedBuffer<'r, R, f32>,
	/// Samples that passed the filter; the first element holds the reassignment count
	pub passed: DistributedBuffer<'r, R, u32>,
}
impl<'r, R: Runtime> YinyangBuffers<'r, R> {
	/// Allocate the buffers for `problem`, `None` if yinyang grouping is disabled.
	///
	/// The group centroids are only read while the groups are formed, before `passed` is written for
	/// the first time. If they fit, they therefore live in the memory of `passed`.
	pub fn allocate(runtime: &'r R, pool: &DevicePool, problem: &Problem) -> Result<Option<Self>> {
		if problem.yinyang_groups == 0 {
			return Ok(None);
		}
		let sizes = YinyangSizes::new(problem, pool);
		debug!("yinyang buffer sizes: {:?}", sizes);
		let group_assignments = DistributedBuffer::allocate(runtime, pool, problem.clusters_size as usize)?;
		let bounds = DistributedBuffer::allocate(runtime, pool, sizes.bounds)?;
		let drifts = DistributedBuffer::allocate(runtime, pool, sizes.drifts)?;
		let passed = DistributedBuffer::<_, u32>::allocate(runtime, pool, sizes.passed)?;
		let group_centroids = if sizes.reuses_passed() {
			debug!("reusing passed for the group centroids");
			passed.alias::<f32>(sizes.group_centroids)?
		} else {
			DistributedBuffer::allocate(runtime, pool, sizes.group_centroids)?
		};
		Ok(Some(Self { group_assignments, group_centroids, bounds, drifts, passed }))
	}
}

/// Run the refinement until the kernels report convergence or an error.
pub(crate) fn refine<R: Runtime, K: Kernels>(
	runtime: &R, kernels: &K, problem: &Problem, tolerance: f32, pool: &DevicePool, buffers: RefineBuffers<'_, '_, R>,
) -> Result<()> {
	kernels.yinyang(runtime, problem, tolerance, pool, buffers).map_err(|e| {
		debug!("yinyang refinement failed: {}", e);
		e
	})
}

pub(crate) fn calculate<R: Runtime, K: Kernels>(
	kmean: &KMeans<'_, R, K>, samples_size: u32, features_size: u16, clusters_size: u32, data: KMeansData<'_>,
	config: &KMeansConfig,
) -> Result<()> {
	let (runtime, kernels) = (kmean.runtime, kmean.kernels);
	check_args(runtime, config, samples_size, features_size, clusters_size, &data)?;
	info!("reassignments threshold: {}", reassignments_threshold(config.tolerance, samples_size));
	let problem = Problem {
		samples_size,
		features_size,
		clusters_size,
		yinyang_groups: (config.yinyang_t * clusters_size as f32) as u32,
		metric: config.metric,
		fp16x2: config.fp16x2,
		verbosity: config.verbosity,
	};
	debug!("yinyang groups: {}", problem.yinyang_groups);
	let pool = DevicePool::setup(runtime, config.device_mask, data.designated_device())?;

	let (samples_at, centroids_at, assignments_at) = match &data {
		KMeansData::Host { .. } => (None, None, None),
		KMeansData::Device { device, samples, centroids, assignments } => {
			(Some((*device, *samples)), Some((*device, *centroids)), Some((*device, *assignments)))
		}
	};
	let samples = DistributedBuffer::allocate_or_borrow(runtime, &pool, problem.samples_len(), samples_at)?;
	samples.distribute(&pool, data.samples_origin(), problem.samples_len())?;
	let mut centroids = DistributedBuffer::allocate_or_borrow(runtime, &pool, problem.centroids_len(), centroids_at)?;
	let n = samples_size as usize;
	let mut assignments = DistributedBuffer::allocate_or_borrow(runtime, &pool, n, assignments_at)?;
	let mut prev_assignments = DistributedBuffer::<_, u32>::allocate(runtime, &pool, n)?;
	let mut counts = DistributedBuffer::<_, u32>::allocate(runtime, &pool, clusters_size as usize)?;
	let mut yinyang = YinyangBuffers::allocate(runtime, &pool, &problem)?;

	if config.verbosity > 1 {
		pool.log_memory_stats(runtime)?;
	}
	kernels.setup(runtime, &problem, &pool).map_err(|e| {
		debug!("kernel setup failed: {}", e);
		e
	})?;

	{
		// k-means++ scratch space, both dead before the refinement starts
		let mut dists = assignments.alias::<f32>(n)?;
		let mut sums = prev_assignments.alias::<f32>(n)?;
		let mut rnd = StdRng::seed_from_u64(config.seed);
		inits::initialize(runtime, kernels, &problem, &pool, config.init, data.centroids_origin(), &mut rnd, InitBuffers {
			samples: &samples,
			centroids: &centroids,
			dists: &mut dists,
			sums: &mut sums,
		})
		.map_err(|e| {
			debug!("centroid initialization failed: {}", e);
			e
		})?;
	}

	refine(runtime, kernels, &problem, config.tolerance, &pool, RefineBuffers {
		samples: &samples,
		centroids: &mut centroids,
		counts: &mut counts,
		prev_assignments: &mut prev_assignments,
		assignments: &mut assignments,
		yinyang: yinyang.as_mut(),
	})?;

	results::collect(runtime, &pool, &problem, &centroids, &assignments, data)?;
	debug!("k-means finished");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::DistanceMetric;
	use crate::HostRuntime;

	fn problem(n: u32, f: u16, k: u32, groups: u32) -> Problem {
		Problem {
			samples_size: n, features_size: f, clusters_size: k, yinyang_groups: groups,
			metric: DistanceMetric::L2, fp16x2: false, verbosity: 0,
		}
	}

	#[test]
	fn sizes() {
		let pool = DevicePool::from_devices(vec![0, 1, 2]).unwrap();
		let sizes = YinyangSizes::new(&problem(1000, 8, 50, 5), &pool);
		assert_eq!(sizes.max_length, 334);
		assert_eq!(sizes.bounds, 334 * 6);
		assert_eq!(sizes.drifts, 50 * 8 + 50);
		assert_eq!(sizes.passed, 334);
		assert_eq!(sizes.group_centroids, 40);
		assert!(sizes.reuses_passed());

		// few samples, many features
		let sizes = YinyangSizes::new(&problem(10, 100, 4, 2), &DevicePool::from_devices(vec![0]).unwrap());
		assert_eq!(sizes.passed, 10);
		assert_eq!(sizes.group_centroids, 200);
		assert!(!sizes.reuses_passed());
	}

	#[test]
	fn group_centroids_alias_passed() {
		let runtime = HostRuntime::new(2);
		let pool = DevicePool::from_devices(vec![0, 1]).unwrap();
		assert!(YinyangBuffers::allocate(&runtime, &pool, &problem(100, 4, 10, 0)).unwrap().is_none());

		let yy = YinyangBuffers::allocate(&runtime, &pool, &problem(100, 4, 10, 2)).unwrap().unwrap();
		assert_eq!(yy.group_centroids.ptr(1).as_raw(), yy.passed.ptr(1).as_raw());
		assert!(!yy.group_centroids.slot(0).is_owned());
		// group assignments, bounds, drifts and passed
		assert_eq!(runtime.allocation_count(), 8);
		drop(yy);
		assert_eq!(runtime.allocation_count(), 0);

		let yy = YinyangBuffers::allocate(&runtime, &pool, &problem(10, 100, 4, 2)).unwrap().unwrap();
		assert!(yy.group_centroids.slot(0).is_owned());
		assert_eq!(runtime.allocation_count(), 10);
	}
}
