use crate::api::{KMeansConfig, KMeansData};
use crate::error::{KMeansError, Result};
use crate::runtime::Runtime;
use tracing::info;

/// Reject malformed inputs before any device work starts.
///
/// Checks run in a fixed order and the first failing one decides the error.
pub(crate) fn check_args<R: Runtime>(
	runtime: &R, config: &KMeansConfig, samples_size: u32, features_size: u16, clusters_size: u32, data: &KMeansData<'_>,
) -> Result<()> {
	if clusters_size < 2 || clusters_size == u32::MAX {
		return Err(KMeansError::invalid(format!("clusters_size must be within [2, {}), got {}", u32::MAX, clusters_size)));
	}
	if features_size == 0 {
		return Err(KMeansError::invalid("features_size must not be 0"));
	}
	if samples_size < clusters_size {
		return Err(KMeansError::invalid(format!(
			"samples_size ({}) must not be less than clusters_size ({})", samples_size, clusters_size
		)));
	}

	let installed = runtime
		.device_count()
		.map_err(|e| KMeansError::runtime(format!("failed to query the amount of devices: {}", e)))?;
	let installed_mask = if installed >= 32 { u32::MAX } else { (1u32 << installed) - 1 };
	if installed == 0 || (config.device_mask != 0 && config.device_mask & installed_mask == 0) {
		return Err(KMeansError::NoSuchDevice);
	}

	let (n, f, k) = (samples_size as usize, features_size as usize, clusters_size as usize);
	match data {
		KMeansData::Host { samples, centroids, assignments } => {
			if samples.len() != n * f {
				return Err(KMeansError::invalid(format!("expected {} sample values, got {}", n * f, samples.len())));
			}
			if centroids.len() != k * f {
				return Err(KMeansError::invalid(format!("expected {} centroid values, got {}", k * f, centroids.len())));
			}
			if assignments.len() != n {
				return Err(KMeansError::invalid(format!("expected {} assignments, got {}", n, assignments.len())));
			}
		}
		KMeansData::Device { device, samples, centroids, assignments } => {
			if *device >= installed {
				return Err(KMeansError::NoSuchDevice);
			}
			if samples.is_null() || centroids.is_null() || assignments.is_null() {
				return Err(KMeansError::invalid("device buffers must not be null"));
			}
		}
	}

	if !(0.0..=1.0).contains(&config.tolerance) {
		return Err(KMeansError::invalid(format!("tolerance must be within [0, 1], got {}", config.tolerance)));
	}
	if !(0.0..=0.5).contains(&config.yinyang_t) {
		return Err(KMeansError::invalid(format!("yinyang_t must be within [0, 0.5], got {}", config.yinyang_t)));
	}

	if config.fp16x2 {
		let mask = if config.device_mask == 0 { installed_mask } else { config.device_mask & installed_mask };
		for dev in (0..32).filter(|d| mask & (1u32 << d) != 0) {
			let supported = runtime.compute_capability(dev).map(|cc| (cc.supports_fp16x2(), cc));
			match supported {
				Ok((true, _)) => {}
				Ok((false, cc)) => {
					info!("device #{} has compute capability {}.{}, fp16x2 needs at least 6.0", dev, cc.major, cc.minor);
					return Err(KMeansError::invalid(format!("device {} does not support fp16x2", dev)));
				}
				Err(e) => {
					info!("failed to query the compute capability of device #{}: {}", dev, e);
					return Err(KMeansError::invalid(format!("device {} does not support fp16x2", dev)));
				}
			}
		}
	}
	Ok(())
}
