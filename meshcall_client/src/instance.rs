use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;

use meshcall_protocol::{Result, ServiceInstance, ServiceRpcIn, ServiceRpcOut};

use crate::pool::{Resource, ResourcePool};

/// One usable transport channel to one instance.
#[async_trait]
pub trait Connection: Resource {
    /// Performs one wire call. An `Err` means the call could not complete;
    /// failures reported by the remote service come back in
    /// `ServiceRpcOut::error`.
    async fn call(&self, service_method: &str, rpc_in: ServiceRpcIn) -> Result<ServiceRpcOut>;
}

/// Opens connections to instance addresses.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>>;
}

pub type ConnectionPool = ResourcePool<Arc<dyn Connection>>;

/// Supplies a ready-to-use entry for a newly discovered instance.
pub trait InstanceSource: Send + Sync + 'static {
    fn instance_entry(&self, instance: &ServiceInstance) -> InstanceEntry;
}

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// A discovered instance together with its connection pool.
pub struct InstanceEntry {
    instance: ServiceInstance,
    pool: Arc<ConnectionPool>,
    closed: AtomicBool,
    on_close: Option<CloseHook>,
}

impl InstanceEntry {
    pub fn new(instance: ServiceInstance, pool: Arc<ConnectionPool>) -> Self {
        InstanceEntry {
            instance,
            pool,
            closed: AtomicBool::new(false),
            on_close: None,
        }
    }

    /// Runs `hook` once, the first time the entry is closed.
    pub fn with_close_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn key(&self) -> &str {
        &self.instance.addr
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

// Closing retires the entry. The connection pool may be shared with entries
// of other service clients, so it is left to whoever installed the hook.
impl Resource for InstanceEntry {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.on_close {
            hook();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("addr", &self.instance.addr)
            .field("service", &self.instance.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
