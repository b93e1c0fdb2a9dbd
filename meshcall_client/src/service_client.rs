use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future;
use tokio::{
    sync::{
        mpsc::{self, UnboundedSender},
        oneshot,
    },
    time::{self, Instant, Interval, Sleep},
};
use tracing::{debug, warn};

use meshcall_protocol::{
    new_id, Error, ErrorKind, MeshParam, Query, RequestInfo, Result, SerializeType,
};

use crate::{
    client::Opt,
    discovery::Discovery,
    instance::InstanceSource,
    pool::ResourcePool,
    registry::{Command, InstancePool, Registry, TimeoutPolicy},
    transport::{self, AttemptResult, PreparedCall},
};

const COMMAND_BUFFER: usize = 32;

/// Sends calls to the instances matching one query.
///
/// Instances come and go as discovery reports them. Every call is raced
/// across them: a first attempt starts right away and, when a retry
/// interval is set, another one starts each time it elapses. The first
/// attempt that succeeds, or that reaches the remote service and gets an
/// answer, decides the call. A give-up duration bounds how long the caller
/// waits; attempts still in flight at that point keep running and are
/// ignored.
///
/// Must be created inside a tokio runtime. Dropping the last handle (or
/// calling [`ServiceClient::close`]) unsubscribes from discovery and releases
/// every instance.
pub struct ServiceClient {
    query: Query,
    serialize_type: SerializeType,
    commands: mpsc::Sender<Command>,
    instance_pool: Arc<InstancePool>,
}

impl ServiceClient {
    pub fn new(
        query: Query,
        discovery: Arc<dyn Discovery>,
        source: Arc<dyn InstanceSource>,
        opt: Opt,
    ) -> Self {
        let listen_id = new_id();
        let notifications = discovery.listen(&listen_id, &query);
        let instance_pool = Arc::new(ResourcePool::unbounded());
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let registry = Registry::new(
            listen_id,
            discovery,
            source,
            instance_pool.clone(),
            TimeoutPolicy {
                retry: opt.retry_interval,
                giveup: opt.giveup,
            },
        );
        tokio::spawn(registry.run(notifications, command_rx));

        ServiceClient {
            query,
            serialize_type: opt.serialize_type,
            commands,
            instance_pool,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Sets the time before `send` starts another attempt and the time
    /// before `send` and `send_once` give up. Zero disables either.
    pub async fn set_timeout(&self, retry: Duration, giveup: Duration) -> Result<()> {
        let policy = TimeoutPolicy { retry, giveup };
        self.request(|ack| Command::SetTimeout(policy, ack)).await
    }

    pub async fn get_timeout(&self) -> Result<(Duration, Duration)> {
        let policy = self.request(Command::GetTimeout).await?;
        Ok((policy.retry, policy.giveup))
    }

    /// Addresses of the instances currently known, sorted.
    pub async fn instances(&self) -> Result<Vec<String>> {
        let mut addrs = self.request(Command::Instances).await?;
        addrs.sort();
        Ok(addrs)
    }

    /// Instances waiting in the pool, not counting those leased by attempts.
    pub fn idle_instances(&self) -> usize {
        self.instance_pool.available()
    }

    /// Unsubscribes from discovery and releases every instance. Calls still
    /// waiting for an instance fail with `ErrorKind::Closed`.
    pub async fn close(&self) {
        if self.request(Command::Shutdown).await.is_err() {
            debug!("service client already closed");
        }
    }

    /// Sends a call using the current retry interval and give-up duration.
    ///
    /// An error reported by the remote service does not fail the call by
    /// itself. The reply bytes of that attempt are still decoded into
    /// `output`, and the decode outcome is returned: a reply that decodes
    /// yields `Ok(())` and the remote error is dropped.
    pub async fn send<I, O>(
        &self,
        request_info: Option<RequestInfo>,
        method: &str,
        input: &I,
        output: &mut O,
    ) -> Result<()>
    where
        I: MeshParam + ?Sized,
        O: MeshParam + ?Sized,
    {
        let (retry, giveup) = self.get_timeout().await?;
        self.dispatch(retry, giveup, request_info, method, input, output)
            .await
    }

    /// Sends a call with a single attempt, still bounded by the current
    /// give-up duration.
    pub async fn send_once<I, O>(
        &self,
        request_info: Option<RequestInfo>,
        method: &str,
        input: &I,
        output: &mut O,
    ) -> Result<()>
    where
        I: MeshParam + ?Sized,
        O: MeshParam + ?Sized,
    {
        let (_, giveup) = self.get_timeout().await?;
        self.dispatch(Duration::ZERO, giveup, request_info, method, input, output)
            .await
    }

    async fn dispatch<I, O>(
        &self,
        retry: Duration,
        giveup: Duration,
        request_info: Option<RequestInfo>,
        method: &str,
        input: &I,
        output: &mut O,
    ) -> Result<()>
    where
        I: MeshParam + ?Sized,
        O: MeshParam + ?Sized,
    {
        let st = self.serialize_type;
        let call = Arc::new(PreparedCall {
            request_info: request_info.unwrap_or_else(RequestInfo::new),
            method: method.to_owned(),
            input: input.into_bytes(st).map(Bytes::from),
        });

        let mut ticker = if retry > Duration::ZERO {
            Some(time::interval_at(Instant::now() + retry, retry))
        } else {
            None
        };
        let mut deadline = if giveup > Duration::ZERO {
            Some(Box::pin(time::sleep(giveup)))
        } else {
            None
        };

        // keeping a sender here means `recv` never sees a closed channel
        let (results, mut attempts) = mpsc::unbounded_channel();
        self.spawn_attempt(&call, &results);

        let mut last_error: Option<Error> = None;
        loop {
            tokio::select! {
                _ = tick(&mut ticker) => {
                    debug!(method, request_id = %call.request_info.request_id, "retrying");
                    self.spawn_attempt(&call, &results);
                }
                _ = expire(&mut deadline) => {
                    return Err(last_error.unwrap_or_else(|| {
                        Error::new(ErrorKind::Timeout, "request timed out")
                    }));
                }
                Some(attempt) = attempts.recv() => {
                    match attempt.error {
                        Some(err) if !err.is_remote() => {
                            warn!(method, error = %err, "attempt failed");
                            if giveup == Duration::ZERO {
                                return Err(err);
                            }
                            last_error = Some(err);
                        }
                        // A remote error is not returned: the reply bytes
                        // are decoded and the decode outcome decides the call.
                        _ => return output.from_slice(st, &attempt.output),
                    }
                }
            }
        }
    }

    fn spawn_attempt(&self, call: &Arc<PreparedCall>, results: &UnboundedSender<AttemptResult>) {
        let instances = self.instance_pool.clone();
        let call = call.clone();
        let results = results.clone();
        tokio::spawn(async move {
            let attempt = attempt_send(&instances, &call).await;
            // the caller may have stopped listening
            let _ = results.send(attempt);
        });
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }
}

/// Leases an instance, then one of its connections, and makes the call.
/// Both leases go back to their pools when this returns or is dropped.
async fn attempt_send(instances: &Arc<InstancePool>, call: &PreparedCall) -> AttemptResult {
    let instance = match instances.acquire().await {
        Ok(instance) => instance,
        Err(err) => {
            warn!(error = %err, "failed to acquire instance");
            return AttemptResult::failed(err);
        }
    };

    let conn = match instance.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(addr = %instance.key(), error = %err, "failed to acquire connection");
            return AttemptResult::failed(err);
        }
    };

    transport::send_to_instance(&conn, instance.instance(), call).await
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => future::pending().await,
    }
}

fn closed() -> Error {
    Error::new(ErrorKind::Closed, "service client is closed")
}
