use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{
    mpsc::{Receiver, UnboundedReceiver},
    oneshot,
};
use tracing::{debug, info};

use meshcall_protocol::{InstanceNotificationType, ServiceInstance};

use crate::{
    discovery::{Discovery, NotificationBatch},
    instance::{InstanceEntry, InstanceSource},
    pool::{Resource, ResourcePool},
};

pub type InstancePool = ResourcePool<Arc<InstanceEntry>>;

/// Retry cadence and give-up deadline of a service client. Zero disables
/// either one.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub retry: Duration,
    pub giveup: Duration,
}

pub(crate) enum Command {
    GetTimeout(oneshot::Sender<TimeoutPolicy>),
    SetTimeout(TimeoutPolicy, oneshot::Sender<()>),
    Instances(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Owner of the instance map. Runs as a single task: discovery batches and
/// timeout reads/writes are handled one at a time, so readers always see a
/// complete policy and the map never needs a lock.
pub(crate) struct Registry {
    listen_id: String,
    discovery: Arc<dyn Discovery>,
    source: Arc<dyn InstanceSource>,
    instances: HashMap<String, Arc<InstanceEntry>>,
    instance_pool: Arc<InstancePool>,
    policy: TimeoutPolicy,
}

impl Registry {
    pub(crate) fn new(
        listen_id: String,
        discovery: Arc<dyn Discovery>,
        source: Arc<dyn InstanceSource>,
        instance_pool: Arc<InstancePool>,
        policy: TimeoutPolicy,
    ) -> Self {
        Registry {
            listen_id,
            discovery,
            source,
            instances: HashMap::new(),
            instance_pool,
            policy,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut notifications: UnboundedReceiver<NotificationBatch>,
        mut commands: Receiver<Command>,
    ) {
        let mut discovery_open = true;
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                batch = notifications.recv(), if discovery_open => match batch {
                    Some(batch) => self.apply(batch),
                    None => {
                        debug!(listen_id = %self.listen_id, "discovery stream closed");
                        discovery_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::GetTimeout(reply)) => {
                        let _ = reply.send(self.policy);
                    }
                    Some(Command::SetTimeout(policy, ack)) => {
                        self.policy = policy;
                        let _ = ack.send(());
                    }
                    Some(Command::Instances(reply)) => {
                        let _ = reply.send(self.instances.keys().cloned().collect());
                    }
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.shutdown();
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn apply(&mut self, batch: NotificationBatch) {
        for n in batch {
            match n.kind {
                InstanceNotificationType::Add | InstanceNotificationType::Update => {
                    if n.instance.registered {
                        self.add_instance(&n.instance);
                    } else {
                        self.remove_instance(&n.instance);
                    }
                }
                InstanceNotificationType::Remove => self.remove_instance(&n.instance),
            }
        }
    }

    fn add_instance(&mut self, instance: &ServiceInstance) {
        if self.instances.contains_key(&instance.addr) {
            return;
        }

        let entry = Arc::new(self.source.instance_entry(instance));
        self.instances.insert(instance.addr.clone(), entry.clone());
        self.instance_pool.release(entry);
        info!(addr = %instance.addr, service = %instance.name, "service discovered");
    }

    fn remove_instance(&mut self, instance: &ServiceInstance) {
        if let Some(entry) = self.instances.remove(&instance.addr) {
            // the pool drops it the next time it comes around
            entry.close();
            info!(addr = %instance.addr, service = %instance.name, "service removed");
        }
    }

    fn shutdown(&mut self) {
        self.discovery.unlisten(&self.listen_id);
        for (_, entry) in self.instances.drain() {
            entry.close();
        }
        self.instance_pool.close();
        debug!(listen_id = %self.listen_id, "instance registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Connection, ConnectionPool};
    use meshcall_protocol::{Error, ErrorKind, InstanceNotification, Query};
    use tokio::sync::mpsc;

    struct NoConnections;

    impl InstanceSource for NoConnections {
        fn instance_entry(&self, instance: &ServiceInstance) -> InstanceEntry {
            let pool: ConnectionPool = ResourcePool::new(1, || async {
                Err::<Arc<dyn Connection>, _>(Error::new(ErrorKind::Transport, "unused"))
            });
            InstanceEntry::new(instance.clone(), Arc::new(pool))
        }
    }

    struct Harness {
        registry: Registry,
        pool: Arc<InstancePool>,
    }

    fn harness(discovery: Arc<dyn Discovery>) -> Harness {
        let pool = Arc::new(ResourcePool::unbounded());
        let registry = Registry::new(
            "l1".to_owned(),
            discovery,
            Arc::new(NoConnections),
            pool.clone(),
            TimeoutPolicy::default(),
        );
        Harness { registry, pool }
    }

    fn instance(addr: &str, registered: bool) -> ServiceInstance {
        let mut s = ServiceInstance::new("Arith", addr);
        s.registered = registered;
        s
    }

    fn keys(registry: &Registry) -> Vec<String> {
        let mut keys: Vec<String> = registry.instances.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn add_is_idempotent() {
        let mut h = harness(Arc::new(crate::StaticDiscovery::new()));
        h.registry.apply(vec![
            InstanceNotification::add(instance("a:1", true)),
            InstanceNotification::add(instance("a:1", true)),
            InstanceNotification::update(instance("a:1", true)),
        ]);
        assert_eq!(vec!["a:1".to_owned()], keys(&h.registry));
        assert_eq!(1, h.pool.available());
    }

    #[test]
    fn removal_paths() {
        let mut h = harness(Arc::new(crate::StaticDiscovery::new()));
        h.registry.apply(vec![
            InstanceNotification::add(instance("a:1", true)),
            InstanceNotification::add(instance("b:1", true)),
            InstanceNotification::add(instance("c:1", true)),
        ]);
        let b = h.registry.instances["b:1"].clone();

        h.registry.apply(vec![
            InstanceNotification::update(instance("b:1", false)),
            InstanceNotification::remove(instance("c:1", true)),
            InstanceNotification::remove(instance("unknown:1", true)),
        ]);

        assert_eq!(vec!["a:1".to_owned()], keys(&h.registry));
        assert!(b.is_closed());
        assert_eq!(1, h.pool.available());
    }

    #[test]
    fn unregistered_add_removes() {
        let mut h = harness(Arc::new(crate::StaticDiscovery::new()));
        h.registry
            .apply(vec![InstanceNotification::add(instance("a:1", true))]);
        h.registry
            .apply(vec![InstanceNotification::add(instance("a:1", false))]);
        assert!(keys(&h.registry).is_empty());
    }

    #[test]
    fn readd_after_remove_creates_fresh_entry() {
        let mut h = harness(Arc::new(crate::StaticDiscovery::new()));
        h.registry.apply(vec![
            InstanceNotification::add(instance("a:1", true)),
            InstanceNotification::remove(instance("a:1", true)),
            InstanceNotification::add(instance("a:1", true)),
        ]);
        assert!(!h.registry.instances["a:1"].is_closed());
        assert_eq!(1, h.pool.available());
    }

    #[tokio::test]
    async fn serves_commands_and_shuts_down() {
        let discovery = Arc::new(crate::StaticDiscovery::new());
        let notifications = discovery.listen("l1", &Query::default());
        let h = harness(discovery.clone());
        let pool = h.pool.clone();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(h.registry.run(notifications, rx));

        discovery.add(instance("a:1", true));

        let policy = TimeoutPolicy {
            retry: Duration::from_millis(5),
            giveup: Duration::from_millis(50),
        };
        let (ack, done) = oneshot::channel();
        tx.send(Command::SetTimeout(policy, ack)).await.unwrap();
        done.await.unwrap();

        let (reply, got) = oneshot::channel();
        tx.send(Command::GetTimeout(reply)).await.unwrap();
        assert_eq!(policy, got.await.unwrap());

        let (reply, got) = oneshot::channel();
        tx.send(Command::Instances(reply)).await.unwrap();
        let mut seen = got.await.unwrap();
        // discovery and commands race; poll until the add lands
        while seen.is_empty() {
            tokio::task::yield_now().await;
            let (reply, got) = oneshot::channel();
            tx.send(Command::Instances(reply)).await.unwrap();
            seen = got.await.unwrap();
        }
        assert_eq!(vec!["a:1".to_owned()], seen);

        let (ack, done) = oneshot::channel();
        tx.send(Command::Shutdown(ack)).await.unwrap();
        done.await.unwrap();
        task.await.unwrap();

        assert_eq!(0, discovery.listener_count());
        assert!(pool.is_closed());
    }
}
