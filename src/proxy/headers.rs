//! Header filtering in both directions, plus per-group header rules.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::{HeaderAction, HeaderRule};

/// Connection-scoped headers that must not be forwarded by a proxy.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Inbound credentials; the channel sets the upstream one itself.
const CLIENT_CREDENTIALS: [&str; 3] = ["authorization", "x-api-key", "x-goog-api-key"];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Client headers to send upstream.
///
/// Drops client credentials, hop-by-hop headers, `host`, `content-length`
/// (the body may be rewritten) and `accept-encoding` (so the body can be
/// inspected).
pub fn forward_request_headers(inbound: &HeaderMap, is_stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name)
            || CLIENT_CREDENTIALS.contains(&name.as_str())
            || [header::HOST, header::CONTENT_LENGTH, header::ACCEPT_ENCODING].contains(name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if is_stream {
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
    }
    headers
}

/// Upstream response headers to send to the client.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Force the event-stream headers on a streaming response.
pub fn apply_stream_headers(headers: &mut HeaderMap) {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
}

/// Values available to `${...}` placeholders in header rules.
pub struct HeaderVars<'a> {
    pub client_ip: &'a str,
    pub group: &'a str,
    pub api_key: &'a str,
    pub timestamp_ms: i64,
}

impl HeaderVars<'_> {
    fn expand(&self, template: &str) -> String {
        template
            .replace("${CLIENT_IP}", self.client_ip)
            .replace("${GROUP_NAME}", self.group)
            .replace("${API_KEY}", self.api_key)
            .replace("${TIMESTAMP_MS}", &self.timestamp_ms.to_string())
    }
}

/// Apply a group's header rules in order. Rules producing an invalid header
/// value are skipped with a warning.
pub fn apply_header_rules(headers: &mut HeaderMap, rules: &[HeaderRule], vars: &HeaderVars<'_>) {
    for rule in rules {
        let Ok(name) = HeaderName::from_bytes(rule.key.as_bytes()) else {
            tracing::warn!(header = %rule.key, "skipping header rule with invalid name");
            continue;
        };
        match rule.action {
            HeaderAction::Remove => {
                headers.remove(&name);
            }
            HeaderAction::Set => match HeaderValue::from_str(&vars.expand(&rule.value)) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => {
                    tracing::warn!(header = %rule.key, "skipping header rule with invalid value");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer client-token".parse().unwrap());
        headers.insert("x-api-key", "client-key".parse().unwrap());
        headers.insert("x-goog-api-key", "client-goog".parse().unwrap());
        headers.insert(header::HOST, "relay.local".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "12".parse().unwrap());
        headers.insert(header::ACCEPT_ENCODING, "br".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert("anthropic-beta", "tools-2024".parse().unwrap());
        headers
    }

    #[test]
    fn forwarded_headers_drop_credentials_and_hop_by_hop() {
        let forwarded = forward_request_headers(&inbound(), false);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[header::CONTENT_TYPE], "application/json");
        assert_eq!(forwarded["anthropic-beta"], "tools-2024");
    }

    #[test]
    fn streaming_requests_disable_proxy_buffering() {
        let forwarded = forward_request_headers(&inbound(), true);
        assert_eq!(forwarded["x-accel-buffering"], "no");
    }

    #[test]
    fn response_headers_skip_length_and_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_LENGTH, "99".parse().unwrap());
        upstream.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        upstream.insert("x-ratelimit-remaining", "10".parse().unwrap());
        let headers = response_headers(&upstream);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-ratelimit-remaining"], "10");
    }

    #[test]
    fn stream_headers_are_forced() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        apply_stream_headers(&mut headers);
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[test]
    fn header_rules_expand_variables_and_remove() {
        let mut headers = HeaderMap::new();
        headers.insert("x-drop", "me".parse().unwrap());
        let rules = vec![
            HeaderRule {
                key: "X-Forwarded-For".into(),
                value: "${CLIENT_IP}".into(),
                action: HeaderAction::Set,
            },
            HeaderRule {
                key: "X-Trace".into(),
                value: "${GROUP_NAME}-${TIMESTAMP_MS}".into(),
                action: HeaderAction::Set,
            },
            HeaderRule {
                key: "X-Drop".into(),
                value: String::new(),
                action: HeaderAction::Remove,
            },
        ];
        let vars = HeaderVars {
            client_ip: "10.0.0.7",
            group: "openai",
            api_key: "sk-x",
            timestamp_ms: 1_700_000_000_000,
        };
        apply_header_rules(&mut headers, &rules, &vars);
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7");
        assert_eq!(headers["x-trace"], "openai-1700000000000");
        assert!(headers.get("x-drop").is_none());
    }
}
