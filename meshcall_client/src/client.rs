use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::debug;

use meshcall_protocol::{Query, SerializeType, ServiceInstance};

use crate::{
    discovery::Discovery,
    instance::{ConnectionPool, Connector, InstanceEntry, InstanceSource},
    pool::ResourcePool,
    service_client::ServiceClient,
};

#[derive(Debug, Copy, Clone)]
pub struct Opt {
    pub serialize_type: SerializeType,
    /// upper bound on open connections to a single instance
    pub max_connections_per_instance: usize,
    /// initial retry interval of new service clients
    pub retry_interval: Duration,
    /// initial give-up duration of new service clients
    pub giveup: Duration,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            serialize_type: SerializeType::JSON,
            max_connections_per_instance: 10,
            retry_interval: Duration::ZERO,
            giveup: Duration::ZERO,
        }
    }
}

struct SharedPool {
    pool: Arc<ConnectionPool>,
    // open instance entries using `pool`
    entries: usize,
}

type PoolMap = Mutex<HashMap<String, SharedPool>>;

/// One bounded connection pool per instance address, filled lazily by the
/// connector. Service clients of the same `Client` share the pool of an
/// address; it is closed when the last entry using it is closed.
pub struct ConnectionPools {
    capacity: usize,
    connector: Arc<dyn Connector>,
    pools: Arc<PoolMap>,
}

impl ConnectionPools {
    pub fn new(connector: Arc<dyn Connector>, capacity: usize) -> Self {
        ConnectionPools {
            capacity,
            connector,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of addresses with an open connection pool.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checkout(&self, addr: &str) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock();
        let shared = pools.entry(addr.to_owned()).or_insert_with(|| {
            debug!(addr, capacity = self.capacity, "new connection pool");
            let connector = self.connector.clone();
            let addr = addr.to_owned();
            SharedPool {
                pool: Arc::new(ResourcePool::new(self.capacity, move || {
                    let connector = connector.clone();
                    let addr = addr.clone();
                    async move { connector.connect(&addr).await }
                })),
                entries: 0,
            }
        });
        shared.entries += 1;
        shared.pool.clone()
    }

    fn checkin(pools: &PoolMap, addr: &str, pool: &Arc<ConnectionPool>) {
        let mut map = pools.lock();
        let last = match map.get_mut(addr) {
            Some(shared) if Arc::ptr_eq(&shared.pool, pool) => {
                shared.entries -= 1;
                shared.entries == 0
            }
            _ => return,
        };
        if last {
            map.remove(addr);
            drop(map);
            pool.close();
            debug!(addr, "connection pool closed");
        }
    }

    pub fn close(&self) {
        let drained: Vec<SharedPool> = self.pools.lock().drain().map(|(_, s)| s).collect();
        for shared in drained {
            shared.pool.close();
        }
    }
}

impl InstanceSource for ConnectionPools {
    fn instance_entry(&self, instance: &ServiceInstance) -> InstanceEntry {
        let pool = self.checkout(&instance.addr);
        let pools = Arc::downgrade(&self.pools);
        let addr = instance.addr.clone();
        let released = pool.clone();
        InstanceEntry::new(instance.clone(), pool).with_close_hook(move || {
            if let Some(pools) = pools.upgrade() {
                ConnectionPools::checkin(&pools, &addr, &released);
            }
        })
    }
}

/// Entry point: hands out one `ServiceClient` per query, all sharing the
/// same discovery and connection pools.
pub struct Client {
    pub opt: Opt,
    discovery: Arc<dyn Discovery>,
    pools: Arc<ConnectionPools>,
    services: Mutex<HashMap<Query, Arc<ServiceClient>>>,
}

impl Client {
    pub fn new(opt: Opt, discovery: Arc<dyn Discovery>, connector: Arc<dyn Connector>) -> Self {
        Client {
            opt,
            discovery,
            pools: Arc::new(ConnectionPools::new(
                connector,
                opt.max_connections_per_instance,
            )),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the service client for `query`, creating it on first use.
    /// Must be called inside a tokio runtime.
    pub fn get_service(&self, query: Query) -> Arc<ServiceClient> {
        let mut services = self.services.lock();
        services
            .entry(query.clone())
            .or_insert_with(|| {
                let source: Arc<dyn InstanceSource> = self.pools.clone();
                Arc::new(ServiceClient::new(
                    query,
                    self.discovery.clone(),
                    source,
                    self.opt,
                ))
            })
            .clone()
    }

    /// Tears down every service client and closes every connection pool.
    pub async fn close(&self) {
        let services: Vec<Arc<ServiceClient>> =
            self.services.lock().drain().map(|(_, s)| s).collect();
        for service in services {
            service.close().await;
        }
        self.pools.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::StaticDiscovery, instance::Connection, pool::Resource};
    use async_trait::async_trait;
    use meshcall_protocol::{Error, ErrorKind, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorKind::Transport, format!("refused: {}", addr)))
        }
    }

    #[test]
    fn default_opt() {
        let opt = Opt::default();
        assert_eq!(SerializeType::JSON, opt.serialize_type);
        assert_eq!(10, opt.max_connections_per_instance);
        assert_eq!(Duration::ZERO, opt.retry_interval);
        assert_eq!(Duration::ZERO, opt.giveup);
    }

    #[tokio::test]
    async fn pools_are_shared_per_address() {
        let connector = Arc::new(CountingConnector::default());
        let pools = ConnectionPools::new(connector.clone(), 2);
        let a = pools.instance_entry(&ServiceInstance::new("Arith", "a:1"));
        let b = pools.instance_entry(&ServiceInstance::new("Echo", "a:1"));
        assert!(Arc::ptr_eq(a.pool(), b.pool()));
        assert_eq!(1, pools.len());

        let err = a.pool().acquire().await.map(|_| ()).unwrap_err();
        assert_eq!(ErrorKind::Acquire, err.kind());
        assert_eq!(1, connector.connects.load(Ordering::SeqCst));

        a.close();
        a.close();
        assert!(!b.pool().is_closed());
        assert_eq!(1, pools.len());

        b.close();
        assert!(b.pool().is_closed());
        assert!(pools.is_empty());
    }

    #[tokio::test]
    async fn readded_address_gets_a_fresh_pool() {
        let pools = ConnectionPools::new(Arc::new(CountingConnector::default()), 2);
        let old = pools.instance_entry(&ServiceInstance::new("Arith", "a:1"));
        old.close();
        let new = pools.instance_entry(&ServiceInstance::new("Arith", "a:1"));
        assert!(old.pool().is_closed());
        assert!(!new.pool().is_closed());
        assert!(!Arc::ptr_eq(old.pool(), new.pool()));

        pools.close();
        assert!(new.pool().is_closed());
        assert!(pools.is_empty());
        // closing after the pools are gone is harmless
        new.close();
    }

    #[tokio::test]
    async fn service_clients_are_cached_per_query() {
        let discovery = Arc::new(StaticDiscovery::new());
        let client = Client::new(
            Opt::default(),
            discovery.clone(),
            Arc::new(CountingConnector::default()),
        );

        let a = client.get_service(Query::service("Arith"));
        let b = client.get_service(Query::service("Arith"));
        let c = client.get_service(Query::service("Echo"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(2, discovery.listener_count());

        client.close().await;
        assert_eq!(0, discovery.listener_count());
        assert_eq!(
            ErrorKind::Closed,
            a.get_timeout().await.unwrap_err().kind()
        );
    }
}
