use crate::request::Request;
use crate::response::Response;

/// Narrow response cache hook. Freshness and validation policy belong to the
/// implementation; the chain only looks entries up for `GET`, stores `200`
/// responses to `GET`, and removes entries after unsafe methods.
pub trait ResponseCache: Send + Sync {
    fn get(&self, request: &Request) -> Option<Response>;

    fn put(&self, response: &Response);

    fn remove(&self, request: &Request);
}
