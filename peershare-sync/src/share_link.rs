//! Share links: a URL whose `share` query parameter carries the host id.

use url::Url;

use crate::PeerId;

/// Query parameter carrying the host id.
pub const SHARE_PARAM: &str = "share";

/// `base` with `?share=<host>` set (replacing any previous value).
pub fn share_url(base: &Url, host: &PeerId) -> Url {
    let mut url = base.clone();
    let others: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != SHARE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.extend_pairs(others);
        query.append_pair(SHARE_PARAM, host.as_str());
    }
    url
}

/// Host id from a share link. A `ws://` URL or a string that does not
/// parse as a URL is taken as the id itself.
pub fn host_from_url(input: &str) -> Option<PeerId> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let Ok(url) = Url::parse(input) else {
        return Some(PeerId::from(input));
    };
    match url.query_pairs().find(|(key, _)| key == SHARE_PARAM) {
        Some((_, value)) if !value.is_empty() => Some(PeerId::from(value.into_owned())),
        Some(_) => None,
        // A WebSocket host id is itself a URL
        None if matches!(url.scheme(), "ws" | "wss") => Some(PeerId::from(input)),
        None => None,
    }
}
