use std::io;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::chain::{Chain, Interceptor};
use crate::connection::{Connection, EstablishOptions};
use crate::error::{Error, TransportErrorKind};
use crate::pool::PooledConnection;
use crate::request::Request;
use crate::response::Response;
use crate::route::{Address, RouteDatabase, RouteSelector};

/// Route state for one destination within one call. Survives recovery
/// retries so a failed route is not offered again; follow-up requests start
/// a fresh one.
pub(crate) struct ExchangeFinder {
    selector: RouteSelector,
}

impl ExchangeFinder {
    fn new(address: Address, url: Url, route_database: Arc<RouteDatabase>) -> Self {
        Self {
            selector: RouteSelector::new(address, url, route_database),
        }
    }

    pub(crate) fn has_more_routes(&self) -> bool {
        self.selector.has_next()
    }
}

/// Finds a pooled connection or establishes a new one, then hands the
/// exchange to the network stages.
pub(crate) struct ConnectStage;

impl Interceptor for ConnectStage {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let call = chain.call().clone();
        let client = call.client().clone();
        let request = chain.request().clone();
        let timeouts = chain.timeouts();
        let address = client.address(request.url())?;

        let connection = match client.connection_pool().acquire(&address) {
            Some(pooled) => pooled,
            None => {
                let state = chain.state();
                if state.finder.as_ref().is_none_or(|finder| {
                    finder.selector.address() != &address || !finder.has_more_routes()
                }) {
                    state.finder = Some(ExchangeFinder::new(
                        address.clone(),
                        request.url().clone(),
                        client.route_database(),
                    ));
                }
                let options = EstablishOptions {
                    connect_timeout: timeouts.connect,
                    read_timeout: timeouts.read,
                    write_timeout: timeouts.write,
                    ping_interval: client.ping_interval(),
                    user_agent: client.user_agent().clone(),
                    watchdog: client.watchdog().clone(),
                    retry_on_connection_failure: client.retry_on_connection_failure(),
                    call: Some(call.clone()),
                };
                establish(chain, &options, &request, &address)?
            }
        };

        let state = chain.state();
        state.last_route = Some(connection.route().clone());
        state.last_connection_reused = connection.is_reused();
        call.set_active_transport(Some(connection.shutdown_handle()));
        client.event_listener().connection_acquired(&call, &connection);
        state.connection = Some(connection);

        let result = chain.proceed(request);

        call.set_active_transport(None);
        if let Some(connection) = chain.state().connection.take() {
            client.event_listener().connection_released(&call, &connection);
            drop(connection);
        }
        result
    }
}

fn establish(
    chain: &mut Chain<'_>,
    options: &EstablishOptions,
    request: &Request,
    address: &Address,
) -> crate::Result<PooledConnection> {
    let call = chain.call().clone();
    let client = call.client().clone();
    let state = chain.state();
    let Some(finder) = state.finder.as_mut() else {
        return Err(Error::Interceptor {
            message: "connect stage has no route selector".to_owned(),
        });
    };

    let Some(route) = finder.selector.next_route()? else {
        return Err(Error::Connect {
            kind: TransportErrorKind::Connect,
            route: format!("{}:{}", address.host(), address.port()),
            source: Box::new(io::Error::new(
                io::ErrorKind::NotConnected,
                "exhausted all routes",
            )),
        });
    };

    debug!(route = %route, "establishing connection");
    client.event_listener().connect_start(&call, &route);
    let established = Connection::establish(&route, options, request);
    if call.is_canceled() {
        call.set_active_transport(None);
        if let Ok(connection) = &established {
            connection.close();
        }
        let error = call.canceled_error();
        client.event_listener().connect_failed(&call, &route, &error);
        state.last_route = Some(route);
        return Err(error);
    }
    match established {
        Ok(connection) => {
            client.route_database().connected(&route);
            client
                .event_listener()
                .connect_end(&call, &route, connection.protocol());
            Ok(client.connection_pool().track(connection))
        }
        Err(error) => {
            call.set_active_transport(None);
            if error.is_route_failure() {
                finder
                    .selector
                    .connect_failed(&route, &io::Error::other(error.to_string()));
            }
            client.event_listener().connect_failed(&call, &route, &error);
            state.last_route = Some(route);
            Err(error)
        }
    }
}
