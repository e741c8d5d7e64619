//! Upstream selection for a resolved rule.

use http::HeaderMap;
use rand::Rng;

use crate::domain::rule::RouteRule;
use crate::domain::upstream::Upstream;
use crate::error::Error;

/// Selects an upstream for a request using the thread-local RNG.
pub fn select_upstream<'r>(rule: &'r RouteRule, headers: &HeaderMap) -> Result<&'r Upstream, Error> {
    select_upstream_with(rule, headers, &mut rand::thread_rng())
}

/// Selects an upstream for a request.
///
/// A matching header predicate pins the request to the upstream named by the
/// header value. Otherwise an upstream is drawn with probability
/// `weight / total_weight`; with no weights at all the first upstream is used.
pub fn select_upstream_with<'r, R: Rng + ?Sized>(
    rule: &'r RouteRule,
    headers: &HeaderMap,
    rng: &mut R,
) -> Result<&'r Upstream, Error> {
    let upstream = header_override(rule, headers)
        .or_else(|| weighted(&rule.upstreams, rng))
        .ok_or(Error::NoUpstreamAvailable)?;

    if !upstream.is_available() {
        return Err(Error::NoUpstreamAvailable);
    }
    Ok(upstream)
}

fn header_override<'r>(rule: &'r RouteRule, headers: &HeaderMap) -> Option<&'r Upstream> {
    rule.headers.iter().find_map(|(name, expected)| {
        let value = headers.get(name.as_str())?.to_str().ok()?;
        if value != expected {
            return None;
        }
        rule.upstreams.iter().find(|u| u.name == *expected)
    })
}

fn weighted<'r, R: Rng + ?Sized>(upstreams: &'r [Upstream], rng: &mut R) -> Option<&'r Upstream> {
    let total_weight: u64 = upstreams.iter().map(|u| u64::from(u.weight)).sum();
    if total_weight == 0 {
        return upstreams.first();
    }

    let draw = rng.gen_range(0..total_weight);
    let mut cumulative = 0u64;
    for upstream in upstreams {
        cumulative += u64::from(upstream.weight);
        if cumulative > draw {
            return Some(upstream);
        }
    }

    upstreams.first()
}
