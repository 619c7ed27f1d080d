/// Split `length` rows evenly over `parts` devices.
/// Every device gets `length / parts` rows, the last one additionally takes the remainder.
/// ## Returns
/// `(offset, length)` of the partition owned by pool position `devi`.
pub(crate) fn partition(length: usize, devi: usize, parts: usize) -> (usize, usize) {
	let chunk = length / parts;
	let offset = devi * chunk;
	if devi + 1 == parts {
		(offset, length - offset)
	} else {
		(offset, chunk)
	}
}

/// Longest partition any device of a pool with `parts` devices is assigned.
pub(crate) fn max_distribute_length(length: usize, parts: usize) -> usize {
	(0..parts).map(|devi| partition(length, devi, parts).1).max().unwrap_or(0)
}

#[cfg(test)]
macro_rules! assert_approx_eq {
	($left: expr, $right: expr, $tol: expr) => ({
		match ($left, $right, $tol) {
			(left_val , right_val, tol_val) => {
				let delta = (left_val - right_val).abs();
				if !(delta < tol_val) {
					panic!(
						"assertion failed: `(left ≈ right)` \
						(left: `{}`, right: `{}`) \
						with ∆={:1.1e} (allowed ∆={:e})",
						left_val , right_val, delta, tol_val
					)
				}
			}
		}
	});
	($left: expr, $right: expr) => (assert_approx_eq!(($left), ($right), 1e-6))
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_covers_all_rows() {
		for parts in 1..6 {
			for length in 0..40 {
				let mut next = 0;
				for devi in 0..parts {
					let (offset, len) = partition(length, devi, parts);
					assert_eq!(offset, next);
					next += len;
				}
				assert_eq!(next, length);
			}
		}
	}

	#[test]
	fn last_device_takes_remainder() {
		assert_eq!(partition(10, 0, 3), (0, 3));
		assert_eq!(partition(10, 1, 3), (3, 3));
		assert_eq!(partition(10, 2, 3), (6, 4));
		assert_eq!(max_distribute_length(10, 3), 4);
		assert_eq!(max_distribute_length(10, 1), 10);
	}
}
