//! Built-in interceptors and the order they run in.

use std::sync::Arc;

use crate::chain::Interceptor;

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod follow_up;

/// Application interceptors, retry/follow-up, bridge, cache, connect, network
/// interceptors, call-server. Returns the stage list and the index of the
/// first stage behind the connect stage.
pub(crate) fn assemble(
    interceptors: &[Arc<dyn Interceptor>],
    network_interceptors: &[Arc<dyn Interceptor>],
) -> (Arc<[Arc<dyn Interceptor>]>, usize) {
    let mut stages: Vec<Arc<dyn Interceptor>> =
        Vec::with_capacity(interceptors.len() + network_interceptors.len() + 5);
    stages.extend(interceptors.iter().cloned());
    stages.push(Arc::new(follow_up::RetryAndFollowUp));
    stages.push(Arc::new(bridge::Bridge));
    stages.push(Arc::new(cache::CacheStage));
    stages.push(Arc::new(connect::ConnectStage));
    let network_from = stages.len();
    stages.extend(network_interceptors.iter().cloned());
    stages.push(Arc::new(call_server::CallServer));
    (stages.into(), network_from)
}
