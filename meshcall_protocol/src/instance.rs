use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// One running backend process, as reported by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub version: String,
    pub region: String,
    /// network address, unique per instance
    pub addr: String,
    pub registered: bool,
}

impl ServiceInstance {
    pub fn new(name: &str, addr: &str) -> Self {
        ServiceInstance {
            name: name.to_owned(),
            addr: addr.to_owned(),
            registered: true,
            ..Default::default()
        }
    }

    /// host part of `addr`, or the whole address when it carries no port
    pub fn host(&self) -> &str {
        match self.addr.rfind(':') {
            Some(idx) => &self.addr[..idx],
            None => &self.addr,
        }
    }
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString)]
pub enum InstanceNotificationType {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceNotification {
    pub kind: InstanceNotificationType,
    pub instance: ServiceInstance,
}

impl InstanceNotification {
    pub fn add(instance: ServiceInstance) -> Self {
        InstanceNotification {
            kind: InstanceNotificationType::Add,
            instance,
        }
    }

    pub fn update(instance: ServiceInstance) -> Self {
        InstanceNotification {
            kind: InstanceNotificationType::Update,
            instance,
        }
    }

    pub fn remove(instance: ServiceInstance) -> Self {
        InstanceNotification {
            kind: InstanceNotificationType::Remove,
            instance,
        }
    }
}

/// Filter handed to discovery when subscribing. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    pub service: Option<String>,
    pub version: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
}

impl Query {
    pub fn service(name: &str) -> Self {
        Query {
            service: Some(name.to_owned()),
            ..Default::default()
        }
    }

    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        fn field_matches(want: &Option<String>, got: &str) -> bool {
            want.as_ref().map_or(true, |w| w == got)
        }

        field_matches(&self.service, &instance.name)
            && field_matches(&self.version, &instance.version)
            && field_matches(&self.region, &instance.region)
            && field_matches(&self.host, instance.host())
    }
}
