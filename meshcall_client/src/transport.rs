use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use meshcall_protocol::{
    forward_method, Error, ErrorKind, RequestInfo, Result, ServiceInstance, ServiceRpcIn,
};

use crate::{instance::Connection, pool::Resource};

/// Everything an attempt needs, shared by all attempts of one call.
#[derive(Debug)]
pub(crate) struct PreparedCall {
    pub request_info: RequestInfo,
    pub method: String,
    pub input: Result<Bytes>,
}

/// Outcome of a single attempt.
#[derive(Debug, Default)]
pub struct AttemptResult {
    pub output: Bytes,
    pub error: Option<Error>,
}

impl AttemptResult {
    pub fn failed(err: Error) -> Self {
        AttemptResult {
            output: Bytes::new(),
            error: Some(err),
        }
    }
}

/// Makes one call on a leased connection to `instance`.
///
/// A call that could not complete closes the connection, so its pool
/// discards it on release. A failure reported by the remote service comes
/// back as an `ErrorKind::Remote` error next to whatever bytes it returned.
pub(crate) async fn send_to_instance(
    conn: &Arc<dyn Connection>,
    instance: &ServiceInstance,
    call: &PreparedCall,
) -> AttemptResult {
    let input = match &call.input {
        Ok(input) => input.clone(),
        Err(err) => return AttemptResult::failed(err.clone()),
    };

    let rpc_in = ServiceRpcIn {
        request_info: call.request_info.clone(),
        method: call.method.clone(),
        input,
    };

    match conn.call(&forward_method(&instance.name), rpc_in).await {
        Ok(out) => AttemptResult {
            output: out.output,
            error: out.error.map(|e| Error::new(ErrorKind::Remote, e)),
        },
        Err(err) => {
            conn.close();
            warn!(
                addr = %instance.addr,
                method = %call.method,
                error = %err,
                "rpc transport error"
            );
            // only the service itself may report a remote error
            let err = if err.is_remote() {
                Error::new(ErrorKind::Transport, err.message())
            } else {
                err
            };
            AttemptResult::failed(err)
        }
    }
}
