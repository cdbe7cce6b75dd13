//! Path matching for the gateway data plane.
//!
//! Every candidate route is scored against the request `(path, method)`
//! on a fixed priority ladder; the highest score wins, ties break on
//! route id so a fixed catalog always resolves the same way.
use regex::Regex;

use crate::core::route::Route;

/// Exact path equality.
pub const PRIORITY_EXACT: u32 = 100;
/// Parameterized template like `/users/{id}` with matching literals.
pub const PRIORITY_PARAMS: u32 = 90;
/// The request path extends the route path by at least one segment.
pub const PRIORITY_PREFIX: u32 = 80;
/// Wildcard pattern containing `*`.
pub const PRIORITY_WILDCARD: u32 = 70;

/// Score a single route against a request. Zero means disqualified.
pub fn match_priority(route: &Route, path: &str, method: &str) -> u32 {
    if route.method != method && route.method != "ANY" {
        return 0;
    }

    if route.path == path {
        return PRIORITY_EXACT;
    }

    if matches_with_params(&route.path, path) {
        return PRIORITY_PARAMS;
    }

    if path.starts_with(&format!("{}/", route.path)) {
        return PRIORITY_PREFIX;
    }

    if route.path.contains('*') {
        let pattern = format!("^{}$", regex::escape(&route.path).replace("\\*", ".*"));
        if let Ok(re) = Regex::new(&pattern) {
            if re.is_match(path) {
                return PRIORITY_WILDCARD;
            }
        }
    }

    0
}

/// Resolve the best route for `(path, method)` among `routes`.
///
/// Deterministic under ties: among routes with equal priority the
/// lexicographically smallest id wins.
pub fn best_match<'a, I>(routes: I, path: &str, method: &str) -> Option<&'a Route>
where
    I: IntoIterator<Item = &'a Route>,
{
    let mut best: Option<(&Route, u32)> = None;
    for route in routes {
        let priority = match_priority(route, path, method);
        if priority == 0 {
            continue;
        }
        best = match best {
            None => Some((route, priority)),
            Some((current, current_priority)) => {
                if priority > current_priority
                    || (priority == current_priority && route.id < current.id)
                {
                    Some((route, priority))
                } else {
                    Some((current, current_priority))
                }
            }
        };
    }
    best.map(|(route, _)| route)
}

/// Template match: equal segment count, `{param}` segments match anything,
/// literal segments must compare equal.
fn matches_with_params(route_path: &str, request_path: &str) -> bool {
    if !route_path.contains('{') {
        return false;
    }

    let route_segments: Vec<&str> = route_path.trim_matches('/').split('/').collect();
    let request_segments: Vec<&str> = request_path.trim_matches('/').split('/').collect();

    if route_segments.len() != request_segments.len() {
        return false;
    }

    route_segments
        .iter()
        .zip(request_segments.iter())
        .all(|(tpl, seg)| {
            (tpl.starts_with('{') && tpl.ends_with('}') && !seg.is_empty()) || tpl == seg
        })
}
