//! Garbage Collector: prunes generations by completeness, age, and count.
//!
//! Split into a pure planning function (`plan`) and an effectful `run` that
//! executes the plan via the Subvolume Manager, so the policy itself can be
//! exhaustively unit-tested without any filesystem or process access.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::subvolume::{self, Generation};

#[derive(Debug, Clone, Copy)]
pub struct GcParams {
	pub keep_min: usize,
	pub keep_max: usize,
	pub min_age_days: i64,
	pub max_age_days: i64,
}

impl Default for GcParams {
	fn default() -> Self {
		Self { keep_min: 3, keep_max: 10, min_age_days: 7, max_age_days: 30 }
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcPlan {
	/// Incomplete generations to reap unconditionally (save the one
	/// currently being built, if any).
	pub incomplete_to_delete: Vec<u32>,
	/// Complete generations to prune by the age/count policy.
	pub complete_to_delete: Vec<u32>,
}

/// Decides what the GC would delete, without touching the filesystem.
///
/// `building` excludes the generation currently under construction (there
/// is never one outside an active build, but the Driver always passes it
/// explicitly rather than relying on that invariant holding at every call
/// site). `protected` excludes the generation referenced by `/current` on
/// a live darch host; on a build host (no live `/current` to discover)
/// this is `None` and does not apply.
#[must_use]
pub fn plan(generations: &[Generation], now: DateTime<Utc>, params: GcParams, building: Option<u32>, protected: Option<u32>) -> GcPlan {
	let incomplete_to_delete: Vec<u32> =
		generations.iter().filter(|g| !g.complete && Some(g.number) != building).map(|g| g.number).collect();

	let mut complete: Vec<&Generation> = generations.iter().filter(|g| g.complete).collect();
	complete.sort_by(|a, b| a.number.cmp(&b.number).then(a.created_at.cmp(&b.created_at)));

	let mut complete_to_delete = Vec::new();
	let mut remaining = complete.len();
	let mut idx = 0;
	while remaining > params.keep_min && idx < complete.len() {
		let oldest = complete[idx];
		if Some(oldest.number) == protected {
			// Never delete the live default; skip past it and keep looking
			// at the next-oldest for the count/age constraints.
			idx += 1;
			continue;
		}
		let age_days = oldest.age(now).num_days();
		let over_count_or_age = remaining > params.keep_max || age_days > params.max_age_days;
		if !over_count_or_age {
			break;
		}
		if age_days < params.min_age_days {
			break;
		}
		complete_to_delete.push(oldest.number);
		remaining -= 1;
		idx += 1;
	}

	GcPlan { incomplete_to_delete, complete_to_delete }
}

/// Executes the plan against `<images>`, deleting subvolumes through the
/// Subvolume Manager. Idempotent: running twice with no new generations
/// produces an empty second plan.
pub fn run(images: &std::path::Path, building: Option<u32>, protected: Option<u32>, params: GcParams) -> Result<GcPlan> {
	let generations = subvolume::list_generations(images)?;
	let decided = plan(&generations, Utc::now(), params, building, protected);

	for &number in &decided.incomplete_to_delete {
		info!(number, "reaping incomplete generation");
		subvolume::delete(images, number)?;
	}
	for &number in &decided.complete_to_delete {
		info!(number, "pruning complete generation by GC policy");
		subvolume::delete(images, number)?;
	}
	Ok(decided)
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	fn gen_at_age(number: u32, complete: bool, age_days: i64, now: DateTime<Utc>) -> Generation {
		Generation { number, complete, manifest: None, created_at: now - Duration::days(age_days) }
	}

	#[test]
	fn age_and_count_policy_prunes_oldest_first() {
		let now = Utc::now();
		let ages = [40, 35, 30, 25, 20, 15, 10, 8, 6, 4, 2, 0];
		let generations: Vec<Generation> =
			ages.iter().enumerate().map(|(i, &age)| gen_at_age((i + 1) as u32, true, age, now)).collect();

		let decided = plan(&generations, now, GcParams::default(), None, None);
		assert_eq!(decided.complete_to_delete, vec![1, 2, 3]);
		assert!(decided.incomplete_to_delete.is_empty());

		let remaining = generations.len() - decided.complete_to_delete.len();
		assert_eq!(remaining, 9);
	}

	#[test]
	fn incomplete_generations_are_always_reaped_except_the_one_building() {
		let now = Utc::now();
		let generations = vec![
			gen_at_age(1, true, 1, now),
			gen_at_age(2, false, 0, now),
			gen_at_age(3, false, 0, now),
		];
		let decided = plan(&generations, now, GcParams::default(), Some(3), None);
		assert_eq!(decided.incomplete_to_delete, vec![2]);
	}

	#[test]
	fn keep_min_is_a_floor() {
		let now = Utc::now();
		let generations: Vec<Generation> = (1..=3).map(|n| gen_at_age(n, true, 100, now)).collect();
		let decided = plan(&generations, now, GcParams::default(), None, None);
		assert!(decided.complete_to_delete.is_empty(), "must never prune below keep_min");
	}

	#[test]
	fn min_age_floor_stops_deletion_even_over_keep_max() {
		let now = Utc::now();
		// 11 generations, all brand new: over KEEP_MAX(10) but under MIN_AGE_DAYS(7).
		let generations: Vec<Generation> = (1..=11).map(|n| gen_at_age(n, true, 1, now)).collect();
		let decided = plan(&generations, now, GcParams::default(), None, None);
		assert!(decided.complete_to_delete.is_empty());
	}

	#[test]
	fn protected_generation_is_never_deleted() {
		let now = Utc::now();
		let generations: Vec<Generation> = (1..=12).map(|n| gen_at_age(n, true, 40, now)).collect();
		let decided = plan(&generations, now, GcParams::default(), None, Some(1));
		assert!(!decided.complete_to_delete.contains(&1));
	}

	#[test]
	fn idempotent_on_repeat_plan_with_no_new_generations() {
		let now = Utc::now();
		let generations: Vec<Generation> = (1..=12)
			.map(|n| gen_at_age(n, true, [40, 35, 30, 25, 20, 15, 10, 8, 6, 4, 2, 0][(n - 1) as usize], now))
			.collect();
		let first = plan(&generations, now, GcParams::default(), None, None);
		let survivors: Vec<Generation> =
			generations.into_iter().filter(|g| !first.complete_to_delete.contains(&g.number)).collect();
		let second = plan(&survivors, now, GcParams::default(), None, None);
		assert!(second.complete_to_delete.is_empty());
	}
}
