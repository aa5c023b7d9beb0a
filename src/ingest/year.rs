//! Process-wide "current year" cell (spec.md §5, §9): RFC3164 syslog
//! timestamps carry no year, so the ingest pipeline falls back to this
//! value. A background task refreshes it once a minute; nothing else
//! ever mutates it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

static CURRENT_YEAR: AtomicI32 = AtomicI32::new(1970);

pub fn current_year_value() -> i32 {
	let y = CURRENT_YEAR.load(Ordering::Relaxed);
	if y == 1970 {
		// First touch: seed synchronously so a fallback year is never used
		// before the background refresher has had a chance to run.
		let now = chrono::Utc::now().format("%Y").to_string().parse().unwrap_or(1970);
		CURRENT_YEAR.store(now, Ordering::Relaxed);
		now
	} else {
		y
	}
}

/// Spawns the background task that refreshes the current-year cell once a
/// minute. Runs until the returned handle is dropped or aborted.
pub fn spawn_refresher() -> tokio::task::JoinHandle<()> {
	tokio::spawn(async {
		loop {
			let year: i32 = chrono::Utc::now().format("%Y").to_string().parse().unwrap_or(1970);
			CURRENT_YEAR.store(year, Ordering::Relaxed);
			tokio::time::sleep(Duration::from_secs(60)).await;
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn current_year_is_plausible() {
		let y = current_year_value();
		assert!((2020..=2100).contains(&y));
	}
}
