use super::model::HeaderList;

const VARY: &str = "vary";

/// Decides whether a stored response may answer a new request.
///
/// `request` is the incoming request's headers, `cached_request` the headers
/// stored alongside the response, and `response` the stored response headers.
pub fn vary_matches(request: &HeaderList, cached_request: &HeaderList, response: &HeaderList) -> bool {
    let mut vary_values = response.get_all(VARY).peekable();
    if vary_values.peek().is_none() {
        return true;
    }

    for value in vary_values {
        for token in value.split(',') {
            let name = token.trim();
            if name.is_empty() {
                continue;
            }
            if name == "*" {
                // A wildcard Vary can never be satisfied from a cache.
                return false;
            }

            match (request.get(name), cached_request.get(name)) {
                (None, None) => {}
                (Some(current), Some(stored)) if current == stored => {}
                _ => return false,
            }
        }
    }
    true
}
