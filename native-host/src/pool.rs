//! Hierarchical arena pools
//!
//! A [`Pool`] owns every object allocated from it. Destroying a pool destroys
//! its children first, then runs its registered cleanups (last registered runs
//! first), then releases its allocations. Objects handed out by [`Pool::alloc`]
//! are reachable only through [`Pooled`] handles, which stop resolving the
//! moment the owning pool is torn down.

use crate::error::{NativeError, NativeResult};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PoolState {
	destroyed: bool,
	children: Vec<Pool>,
	cleanups: Vec<Cleanup>,
	objects: Vec<Arc<dyn Any + Send + Sync>>,
}

impl PoolState {
	/// Take everything out so teardown can run without holding the lock.
	fn take(&mut self) -> (Vec<Pool>, Vec<Cleanup>, Vec<Arc<dyn Any + Send + Sync>>) {
		self.destroyed = true;
		(
			std::mem::take(&mut self.children),
			std::mem::take(&mut self.cleanups),
			std::mem::take(&mut self.objects),
		)
	}
}

struct PoolInner {
	tag: String,
	state: Mutex<PoolState>,
}

impl PoolInner {
	fn teardown(&self) {
		let (children, cleanups, objects) = {
			let mut state = self.state.lock();
			if state.destroyed {
				return;
			}
			state.take()
		};

		debug!(
			pool = %self.tag,
			children = children.len(),
			cleanups = cleanups.len(),
			"destroying pool"
		);

		for child in children {
			child.destroy();
		}
		for cleanup in cleanups.into_iter().rev() {
			cleanup();
		}
		drop(objects);
	}
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		self.teardown();
	}
}

/// Handle to a hierarchical arena
#[derive(Clone)]
pub struct Pool {
	inner: Arc<PoolInner>,
}

impl Pool {
	/// Create a root pool
	pub fn new(tag: impl Into<String>) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				tag: tag.into(),
				state: Mutex::new(PoolState::default()),
			}),
		}
	}

	/// Create a sub-pool destroyed together with this one
	pub fn create_child(&self, tag: impl Into<String>) -> NativeResult<Pool> {
		let child = Pool::new(tag);
		let mut state = self.inner.state.lock();
		if state.destroyed {
			return Err(NativeError::PoolDestroyed);
		}
		state.children.push(child.clone());
		Ok(child)
	}

	/// Pool tag, used in log output
	pub fn tag(&self) -> &str {
		&self.inner.tag
	}

	/// Move `value` into the pool and return a pool-scoped handle to it
	pub fn alloc<T: Send + Sync + 'static>(&self, value: T) -> NativeResult<Pooled<T>> {
		let object = Arc::new(value);
		let handle = Pooled {
			object: Arc::downgrade(&object),
		};
		let mut state = self.inner.state.lock();
		if state.destroyed {
			return Err(NativeError::PoolDestroyed);
		}
		state.objects.push(object);
		Ok(handle)
	}

	/// Register `cleanup` to run exactly once when this pool is destroyed
	pub fn register_cleanup<F>(&self, cleanup: F) -> NativeResult<()>
	where
		F: FnOnce() + Send + 'static,
	{
		let mut state = self.inner.state.lock();
		if state.destroyed {
			return Err(NativeError::PoolDestroyed);
		}
		trace!(pool = %self.inner.tag, "registering cleanup");
		state.cleanups.push(Box::new(cleanup));
		Ok(())
	}

	/// Destroy the pool. Calling it again is a no-op.
	pub fn destroy(&self) {
		self.inner.teardown();
	}

	pub fn is_destroyed(&self) -> bool {
		self.inner.state.lock().destroyed
	}

	pub fn ptr_eq(&self, other: &Pool) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	/// Non-owning handle, for records that live inside this pool
	pub fn downgrade(&self) -> WeakPool {
		WeakPool {
			inner: Arc::downgrade(&self.inner),
		}
	}
}

/// Non-owning pool handle
#[derive(Clone, Default)]
pub struct WeakPool {
	inner: Weak<PoolInner>,
}

impl WeakPool {
	/// Recover the pool; fails when it was dropped or destroyed
	pub fn upgrade(&self) -> NativeResult<Pool> {
		let pool = self
			.inner
			.upgrade()
			.map(|inner| Pool { inner })
			.ok_or(NativeError::PoolDestroyed)?;
		if pool.is_destroyed() {
			return Err(NativeError::PoolDestroyed);
		}
		Ok(pool)
	}
}

impl fmt::Debug for WeakPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WeakPool")
			.field("alive", &(self.inner.strong_count() > 0))
			.finish()
	}
}

impl fmt::Debug for Pool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pool")
			.field("tag", &self.inner.tag)
			.field("destroyed", &self.is_destroyed())
			.finish()
	}
}

/// Borrowed handle to an object living in a [`Pool`]
pub struct Pooled<T> {
	object: Weak<T>,
}

impl<T> Pooled<T> {
	/// Resolve the handle; fails once the owning pool is destroyed
	pub fn get(&self) -> NativeResult<Arc<T>> {
		self.object.upgrade().ok_or(NativeError::PoolDestroyed)
	}

	pub fn is_alive(&self) -> bool {
		self.object.strong_count() > 0
	}

	/// Identity comparison of the underlying native objects
	pub fn ptr_eq(&self, other: &Pooled<T>) -> bool {
		Weak::ptr_eq(&self.object, &other.object)
	}
}

impl<T> Clone for Pooled<T> {
	fn clone(&self) -> Self {
		Self {
			object: self.object.clone(),
		}
	}
}

impl<T> fmt::Debug for Pooled<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pooled")
			.field("alive", &self.is_alive())
			.finish()
	}
}

/// Pool-scoped native record guarded by a mutex
pub type PoolRef<T> = Pooled<Mutex<T>>;

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn test_alloc_resolves_until_destroy() {
		let pool = Pool::new("test");
		let value = pool.alloc(42u32).unwrap();
		assert_eq!(*value.get().unwrap(), 42);

		pool.destroy();
		assert!(matches!(value.get(), Err(NativeError::PoolDestroyed)));
		assert!(!value.is_alive());
	}

	#[test]
	fn test_cleanups_run_once_in_reverse_order() {
		let pool = Pool::new("test");
		let order = Arc::new(Mutex::new(Vec::new()));

		for i in 0..3 {
			let order = order.clone();
			pool.register_cleanup(move || order.lock().push(i)).unwrap();
		}

		pool.destroy();
		pool.destroy();
		assert_eq!(*order.lock(), vec![2, 1, 0]);
	}

	#[test]
	fn test_children_destroyed_before_parent_cleanups() {
		let parent = Pool::new("parent");
		let child = parent.create_child("child").unwrap();
		let order = Arc::new(Mutex::new(Vec::new()));

		let o = order.clone();
		parent.register_cleanup(move || o.lock().push("parent")).unwrap();
		let o = order.clone();
		child.register_cleanup(move || o.lock().push("child")).unwrap();

		parent.destroy();
		assert!(child.is_destroyed());
		assert_eq!(*order.lock(), vec!["child", "parent"]);
	}

	#[test]
	fn test_destroyed_pool_rejects_new_work() {
		let pool = Pool::new("test");
		pool.destroy();
		assert!(pool.alloc(1u8).is_err());
		assert!(pool.register_cleanup(|| {}).is_err());
		assert!(pool.create_child("late").is_err());
	}

	#[test]
	fn test_dropping_last_handle_destroys() {
		let hits = Arc::new(AtomicUsize::new(0));
		{
			let pool = Pool::new("scoped");
			let hits = hits.clone();
			pool.register_cleanup(move || {
				hits.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
		}
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}
}
