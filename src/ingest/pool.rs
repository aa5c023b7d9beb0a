//! A minimal object pool for line readers and record parsers (spec.md §9:
//! "Pooling versus ownership"). Every pooled type exposes a `reset`
//! operation that restores it to construction-equivalent state; the pool
//! itself is just a `Vec` behind a mutex, sized to avoid unbounded growth.

use std::sync::Mutex;

pub trait Resettable {
	fn reset_for_reuse(&mut self);
}

pub struct Pool<T> {
	items: Mutex<Vec<T>>,
	max_idle: usize,
	new_item: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Resettable> Pool<T> {
	pub fn new(max_idle: usize, new_item: impl Fn() -> T + Send + Sync + 'static) -> Self {
		Self {
			items: Mutex::new(Vec::new()),
			max_idle,
			new_item: Box::new(new_item),
		}
	}

	/// Takes an item from the pool, or constructs a fresh one if empty.
	pub fn acquire(&self) -> T {
		let mut items = self.items.lock().expect("pool mutex poisoned");
		items.pop().unwrap_or_else(|| (self.new_item)())
	}

	/// Resets `item` to construction-equivalent state and returns it to the
	/// pool, unless the pool is already at capacity.
	pub fn release(&self, mut item: T) {
		item.reset_for_reuse();
		let mut items = self.items.lock().expect("pool mutex poisoned");
		if items.len() < self.max_idle {
			items.push(item);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	struct Counter(u32);

	impl Resettable for Counter {
		fn reset_for_reuse(&mut self) {
			self.0 = 0;
		}
	}

	#[test]
	fn release_resets_before_returning_to_pool() {
		let pool = Pool::new(4, || Counter(0));
		let mut c = pool.acquire();
		c.0 = 7;
		pool.release(c);
		let c2 = pool.acquire();
		assert_eq!(c2.0, 0);
	}

	#[test]
	fn acquire_constructs_fresh_when_pool_empty() {
		let pool = Pool::new(4, || Counter(9));
		let c = pool.acquire();
		assert_eq!(c.0, 9);
	}

	#[test]
	fn release_beyond_capacity_is_dropped_not_retained() {
		let pool = Pool::new(1, || Counter(0));
		pool.release(Counter(1));
		pool.release(Counter(2));
		let first = pool.acquire();
		let second = pool.acquire();
		assert_eq!(first.0, 0);
		assert_eq!(second.0, 0); // second release exceeded max_idle and was dropped
	}
}
