use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use meshcall::*;

#[derive(MeshParam, Default, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ArithAddArgs {
    #[serde(rename = "A")]
    pub a: u64,
    #[serde(rename = "B")]
    pub b: u64,
}

#[derive(MeshParam, Default, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ArithAddReply {
    #[serde(rename = "C")]
    pub c: u64,
}

/// Serves `Arith.Forward` in-process.
struct Loopback {
    addr: String,
    closed: AtomicBool,
}

impl Resource for Loopback {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for Loopback {
    async fn call(&self, service_method: &str, rpc_in: ServiceRpcIn) -> Result<ServiceRpcOut> {
        if service_method != "Arith.Forward" {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("{} has no service {}", self.addr, service_method),
            ));
        }

        let args: ArithAddArgs = serde_json::from_slice(&rpc_in.input)?;
        let reply = match rpc_in.method.as_str() {
            "Add" => ArithAddReply { c: args.a + args.b },
            "Mul" => ArithAddReply { c: args.a * args.b },
            other => {
                return Ok(ServiceRpcOut {
                    output: Bytes::new(),
                    error: Some(format!("unknown method {}", other)),
                })
            }
        };
        Ok(ServiceRpcOut {
            output: Bytes::from(serde_json::to_vec(&reply)?),
            error: None,
        })
    }
}

struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>> {
        info!(addr, "connecting");
        Ok(Arc::new(Loopback {
            addr: addr.to_owned(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let disc = Arc::new(StaticDiscovery::new());
    disc.add(ServiceInstance::new("Arith", "127.0.0.1:8972"));
    disc.add(ServiceInstance::new("Arith", "127.0.0.1:8973"));

    let mut opt: Opt = Default::default();
    opt.serialize_type = SerializeType::JSON;
    opt.retry_interval = Duration::from_millis(50);
    opt.giveup = Duration::from_secs(1);
    let client = Client::new(opt, disc.clone(), Arc::new(LoopbackConnector));
    let arith = client.get_service(Query::service("Arith"));

    for a in 1..=5 {
        let args = ArithAddArgs { a, b: 10 };
        let mut reply = ArithAddReply::default();
        match arith.send(None, "Mul", &args, &mut reply).await {
            Ok(()) => info!("received: {:?}", reply),
            Err(err) => error!("received err: {}", err),
        }
    }

    disc.remove("127.0.0.1:8972");

    let mut reply = ArithAddReply::default();
    match arith
        .send_once(None, "Add", &ArithAddArgs { a: 1, b: 2 }, &mut reply)
        .await
    {
        Ok(()) => info!("received: {:?}", reply),
        Err(err) => error!("received err: {}", err),
    }

    client.close().await;
}
