use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use meshcall_protocol::{Error, ErrorKind, Result};

/// Something a `ResourcePool` can hand out. Once `close` has been called the
/// pool never gives the resource to anyone again.
pub trait Resource: Send + Sync + 'static {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Resource + ?Sized> Resource for Arc<T> {
    fn close(&self) {
        (**self).close()
    }
    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

type Factory<R> = Box<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// A blocking pool of closeable resources.
///
/// A pool built with [`ResourcePool::new`] owns `capacity` slots and fills
/// them lazily from its factory. A pool built with
/// [`ResourcePool::unbounded`] has no factory: it only ever hands out what
/// was given to it through [`ResourcePool::release`].
pub struct ResourcePool<R: Resource> {
    factory: Option<Factory<R>>,
    // `None` is an empty slot the factory may fill
    slots: Mutex<VecDeque<Option<R>>>,
    // one permit per entry in `slots`
    available: Semaphore,
    closed: AtomicBool,
}

impl<R: Resource> ResourcePool<R> {
    pub fn new<F, Fut>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        ResourcePool {
            factory: Some(Box::new(move || factory().boxed())),
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            available: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        ResourcePool {
            factory: None,
            slots: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits for a resource. Fails with `ErrorKind::Closed` once the pool
    /// is closed, or with `ErrorKind::Acquire` when the factory fails.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease<R>> {
        loop {
            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| pool_closed())?;
            permit.forget();

            let slot = self.slots.lock().pop_front();
            match slot {
                Some(Some(resource)) if !resource.is_closed() => return Ok(self.lease(resource)),
                Some(Some(_)) => {
                    debug!("dropping resource closed while idle");
                    if self.factory.is_none() {
                        continue;
                    }
                }
                Some(None) => {}
                // close() drained the slots after this permit was granted
                None => return Err(pool_closed()),
            }

            let resource = self.create().await?;
            return Ok(self.lease(resource));
        }
    }

    /// Returns a resource to the pool. Closed resources are discarded.
    pub fn release(&self, resource: R) {
        if resource.is_closed() {
            debug!("discarding closed resource");
            if self.factory.is_some() {
                self.put(None);
            }
            return;
        }
        self.put(Some(resource));
    }

    /// Number of idle resources that are still open.
    pub fn available(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| matches!(slot, Some(r) if !r.is_closed()))
            .count()
    }

    /// Closes every idle resource and fails all current and future
    /// acquirers. Resources released afterwards are closed on return.
    pub fn close(&self) {
        let drained: Vec<Option<R>> = {
            let mut slots = self.slots.lock();
            self.closed.store(true, Ordering::SeqCst);
            slots.drain(..).collect()
        };
        self.available.close();
        for resource in drained.into_iter().flatten() {
            resource.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lease(self: &Arc<Self>, resource: R) -> Lease<R> {
        Lease {
            pool: self.clone(),
            resource: Some(resource),
        }
    }

    fn put(&self, slot: Option<R>) {
        let mut slots = self.slots.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(slots);
            if let Some(resource) = slot {
                resource.close();
            }
            return;
        }
        // a bounded pool hands out idle resources before filling empty slots;
        // an unbounded one rotates through what it holds
        if slot.is_some() && self.factory.is_some() {
            slots.push_front(slot);
        } else {
            slots.push_back(slot);
        }
        drop(slots);
        self.available.add_permits(1);
    }

    async fn create(&self) -> Result<R> {
        let factory = match &self.factory {
            Some(factory) => factory,
            None => unreachable!("resource pool without a factory cannot create resources"),
        };

        // the slot goes back if the factory fails or this future is dropped
        let mut slot = EmptySlot {
            pool: self,
            held: true,
        };
        let resource = factory()
            .await
            .map_err(|err| Error::new(ErrorKind::Acquire, err))?;
        slot.held = false;
        Ok(resource)
    }
}

impl<R: Resource> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("bounded", &self.factory.is_some())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn pool_closed() -> Error {
    Error::new(ErrorKind::Closed, "resource pool is closed")
}

struct EmptySlot<'a, R: Resource> {
    pool: &'a ResourcePool<R>,
    held: bool,
}

impl<'a, R: Resource> Drop for EmptySlot<'a, R> {
    fn drop(&mut self) {
        if self.held {
            self.pool.put(None);
        }
    }
}

/// A resource checked out of a pool. Dropping the lease releases it.
pub struct Lease<R: Resource> {
    pool: Arc<ResourcePool<R>>,
    resource: Option<R>,
}

impl<R: Resource> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("lease already released")
    }
}

impl<R: Resource + fmt::Debug> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&self.resource).finish()
    }
}

impl<R: Resource> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct Dummy {
        id: usize,
        closed: AtomicBool,
    }

    impl Dummy {
        fn new(id: usize) -> Arc<Dummy> {
            Arc::new(Dummy {
                id,
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Resource for Dummy {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn counting_pool(capacity: usize) -> (Arc<ResourcePool<Arc<Dummy>>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = ResourcePool::new(capacity, move || {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Dummy::new(id)) }
        });
        (Arc::new(pool), created)
    }

    #[tokio::test]
    async fn unbounded_hands_out_released_resources() {
        let pool = Arc::new(ResourcePool::unbounded());
        pool.release(Dummy::new(7));
        assert_eq!(1, pool.available());

        let lease = pool.acquire().await.unwrap();
        assert_eq!(7, lease.id);
        assert_eq!(0, pool.available());

        drop(lease);
        assert_eq!(1, pool.available());
    }

    #[tokio::test]
    async fn unbounded_blocks_until_release() {
        let pool: Arc<ResourcePool<Arc<Dummy>>> = Arc::new(ResourcePool::unbounded());
        assert!(timeout(Duration::from_millis(20), pool.acquire()).await.is_err());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release(Dummy::new(3));

        assert_eq!(3, waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn closed_resources_are_not_reused() {
        let pool = Arc::new(ResourcePool::unbounded());
        let closed = Dummy::new(1);
        closed.close();
        pool.release(closed);
        assert_eq!(0, pool.available());

        let idle = Dummy::new(2);
        pool.release(idle.clone());
        idle.close();
        pool.release(Dummy::new(3));

        let lease = pool.acquire().await.unwrap();
        assert_eq!(3, lease.id);
    }

    #[tokio::test]
    async fn bounded_creates_lazily_up_to_capacity() {
        let (pool, created) = counting_pool(2);
        assert_eq!(0, created.load(Ordering::SeqCst));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(2, created.load(Ordering::SeqCst));
        assert!(timeout(Duration::from_millis(20), pool.acquire()).await.is_err());

        let a_id = a.id;
        drop(a);
        let c = pool.acquire().await.unwrap();
        assert_eq!(a_id, c.id);
        assert_eq!(2, created.load(Ordering::SeqCst));
        drop(b);
    }

    #[tokio::test]
    async fn bounded_reuses_idle_before_creating() {
        let (pool, created) = counting_pool(2);
        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            assert_eq!(0, lease.id);
        }
        assert_eq!(1, created.load(Ordering::SeqCst));
        assert_eq!(1, pool.available());
    }

    #[tokio::test]
    async fn discarded_resource_frees_its_slot() {
        let (pool, created) = counting_pool(1);
        let lease = pool.acquire().await.unwrap();
        lease.close();
        drop(lease);

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(1, fresh.id);
        assert_eq!(2, created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn factory_failure_returns_the_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool = Arc::new(ResourcePool::new(1, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::new(ErrorKind::Transport, "connection refused"))
                } else {
                    Ok(Dummy::new(n))
                }
            }
        }));

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(ErrorKind::Acquire, err.kind());

        let lease = timeout(Duration::from_millis(100), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, lease.id);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_closes_idle() {
        let pool: Arc<ResourcePool<Arc<Dummy>>> = Arc::new(ResourcePool::unbounded());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (bounded, _) = counting_pool(1);
        let lease = bounded.acquire().await.unwrap();
        let idle: Arc<Dummy> = (*lease).clone();
        drop(lease);
        bounded.close();
        assert!(idle.is_closed());
        assert_eq!(
            ErrorKind::Closed,
            bounded.acquire().await.map(|_| ()).unwrap_err().kind()
        );

        pool.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(ErrorKind::Closed, err.kind());

        let late = Dummy::new(2);
        pool.release(late.clone());
        assert!(late.is_closed());
        assert_eq!(0, pool.available());
    }
}
