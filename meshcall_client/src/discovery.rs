use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use meshcall_protocol::{InstanceNotification, InstanceNotificationType, Query, ServiceInstance};

pub type NotificationBatch = Vec<InstanceNotification>;

/// Source of instance presence events.
///
/// A listener receives ordered batches of notifications for the instances
/// matching its query until it is removed with `unlisten`.
pub trait Discovery: Send + Sync {
    fn listen(&self, listen_id: &str, query: &Query) -> UnboundedReceiver<NotificationBatch>;
    fn unlisten(&self, listen_id: &str);
}

struct Listener {
    query: Query,
    sender: UnboundedSender<NotificationBatch>,
}

/// Discovery over an in-memory set of instances that callers update directly.
#[derive(Default)]
pub struct StaticDiscovery {
    servers: RwLock<HashMap<String, ServiceInstance>>,
    listeners: RwLock<HashMap<String, Listener>>,
}

impl StaticDiscovery {
    pub fn new() -> StaticDiscovery {
        Default::default()
    }

    pub fn get_services(&self) -> Vec<ServiceInstance> {
        self.servers.read().values().cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn add(&self, instance: ServiceInstance) {
        self.publish(vec![InstanceNotification::add(instance)]);
    }

    pub fn update(&self, instance: ServiceInstance) {
        self.publish(vec![InstanceNotification::update(instance)]);
    }

    pub fn remove(&self, addr: &str) {
        let instance = self
            .servers
            .read()
            .get(addr)
            .cloned()
            .unwrap_or_else(|| ServiceInstance {
                addr: addr.to_owned(),
                ..Default::default()
            });
        self.publish(vec![InstanceNotification::remove(instance)]);
    }

    /// Applies a batch to the known set and forwards it, filtered by query,
    /// to every listener.
    pub fn publish(&self, batch: NotificationBatch) {
        let mut servers = self.servers.write();
        for n in &batch {
            match n.kind {
                InstanceNotificationType::Add | InstanceNotificationType::Update
                    if n.instance.registered =>
                {
                    servers.insert(n.instance.addr.clone(), n.instance.clone());
                }
                _ => {
                    servers.remove(&n.instance.addr);
                }
            }
        }

        let listeners = self.listeners.read();
        for listener in listeners.values() {
            let matching: NotificationBatch = batch
                .iter()
                .filter(|n| listener.query.matches(&n.instance))
                .cloned()
                .collect();
            if !matching.is_empty() {
                let _ = listener.sender.send(matching);
            }
        }
    }
}

impl Discovery for StaticDiscovery {
    fn listen(&self, listen_id: &str, query: &Query) -> UnboundedReceiver<NotificationBatch> {
        // holding the server set keeps a concurrent publish from slipping
        // between the snapshot and the registration
        let servers = self.servers.read();
        let (sender, receiver) = mpsc::unbounded_channel();

        let known: NotificationBatch = servers
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .map(InstanceNotification::add)
            .collect();
        if !known.is_empty() {
            let _ = sender.send(known);
        }

        self.listeners.write().insert(
            listen_id.to_owned(),
            Listener {
                query: query.clone(),
                sender,
            },
        );
        receiver
    }

    fn unlisten(&self, listen_id: &str) {
        self.listeners.write().remove(listen_id);
    }
}
