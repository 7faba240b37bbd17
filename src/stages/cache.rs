use http::{Method, StatusCode};
use tracing::debug;

use crate::chain::{Chain, Interceptor};
use crate::response::Response;
use crate::util::redact_url_for_logs;

/// Serves `GET` requests from the configured [`crate::ResponseCache`] and
/// keeps it coherent with unsafe methods.
pub(crate) struct CacheStage;

fn invalidates_cache(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

impl Interceptor for CacheStage {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let request = chain.request().clone();
        let Some(cache) = chain.call().client().cache().cloned() else {
            return chain.proceed(request);
        };

        if *request.method() == Method::GET
            && let Some(hit) = cache.get(&request)
        {
            debug!(url = %redact_url_for_logs(request.url()), "response cache hit");
            return Ok(hit.to_builder().request(request).build());
        }

        let response = chain.proceed(request.clone())?;
        if *request.method() == Method::GET && response.status() == StatusCode::OK {
            cache.put(&response);
        } else if invalidates_cache(request.method()) {
            cache.remove(&request);
        }
        Ok(response)
    }
}
