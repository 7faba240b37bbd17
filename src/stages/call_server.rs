use std::io;
use std::time::{Duration, SystemTime};

use http::header::CONNECTION;

use crate::chain::{Chain, Interceptor};
use crate::connection::guarded;
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::request::Request;
use crate::response::Response;
use crate::util::{duration_millis, header_has_token, redact_url_for_logs};

/// Last stage: writes the request and reads the response on the connection
/// chosen by the connect stage.
pub(crate) struct CallServer;

impl Interceptor for CallServer {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let call = chain.call().clone();
        let request = chain.request().clone();
        let timeouts = chain.timeouts();
        let watchdog = call.client().watchdog().clone();
        let Some(connection) = chain.connection() else {
            return Err(Error::Interceptor {
                message: "no connection available for the exchange".to_owned(),
            });
        };
        let shutdown = connection.shutdown_handle();

        let map_io = |phase: TimeoutPhase, timeout: Option<Duration>, source: io::Error| {
            connection.mark_no_new_exchanges();
            if call.is_canceled() {
                return Error::Canceled {
                    method: request.method().clone(),
                    uri: redact_url_for_logs(request.url()),
                };
            }
            exchange_error(&request, phase, timeout, source)
        };

        let sent_at = SystemTime::now();
        let parts = {
            let mut transport = connection.begin_exchange();
            guarded(&watchdog, timeouts.write, &shutdown, || {
                transport.write_request(&request)
            })
            .map_err(|source| map_io(TimeoutPhase::Write, timeouts.write, source))?;
            guarded(&watchdog, timeouts.read, &shutdown, || transport.read_response())
                .map_err(|source| map_io(TimeoutPhase::Read, timeouts.read, source))?
        };

        if header_has_token(request.headers(), CONNECTION, "close")
            || header_has_token(&parts.headers, CONNECTION, "close")
        {
            connection.mark_no_new_exchanges();
        }

        Ok(Response::builder(request.clone())
            .parts(parts)
            .handshake(connection.handshake().cloned())
            .sent_at(sent_at)
            .received_at(SystemTime::now())
            .build())
    }
}

fn exchange_error(
    request: &Request,
    phase: TimeoutPhase,
    timeout: Option<Duration>,
    source: io::Error,
) -> Error {
    let method = request.method().clone();
    let uri = redact_url_for_logs(request.url());
    if source.kind() == io::ErrorKind::TimedOut {
        return Error::Timeout {
            phase,
            timeout_ms: duration_millis(timeout),
            method,
            uri,
            source: Some(Box::new(source)),
        };
    }
    let kind = match phase {
        TimeoutPhase::Write => TransportErrorKind::Write,
        TimeoutPhase::Read => TransportErrorKind::Read,
        TimeoutPhase::Connect | TimeoutPhase::Call => TransportErrorKind::Other,
    };
    Error::Transport {
        kind,
        method,
        uri,
        source: Box::new(source),
    }
}
