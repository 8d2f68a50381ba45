//! Resolution of connection targets into absolute WebSocket URLs.

use url::Url;

use crate::Result;
use crate::error::Error;

/// Resolve `target` into an absolute WebSocket URL.
///
/// A target that already carries a `ws://` or `wss://` scheme is returned
/// unchanged. Anything else is treated as a path, optionally carrying a query
/// string, relative to `origin`: the origin's `http` scheme maps to `ws` and
/// `https` maps to `wss`, and the path plus query are appended verbatim.
///
/// Pure and deterministic; performs no network access.
pub fn resolve(origin: Option<&Url>, target: &str) -> Result<String> {
    if target.starts_with("ws://") || target.starts_with("wss://") {
        return Ok(target.to_owned());
    }

    let origin = origin
        .ok_or_else(|| Error::validation(format!("relative target {target:?} needs an origin")))?;

    let scheme = match origin.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::validation(format!(
                "origin scheme {other:?} must be http or https"
            )));
        }
    };

    let host = origin
        .host_str()
        .ok_or_else(|| Error::validation("origin has no host"))?;

    Ok(match origin.port() {
        Some(port) => format!("{scheme}://{host}:{port}{target}"),
        None => format!("{scheme}://{host}{target}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(raw: &str) -> Url {
        raw.parse().expect("test origin should parse")
    }

    #[test]
    fn http_origin_maps_to_ws() {
        let resolved = resolve(Some(&origin("http://push.example.com")), "/live").unwrap();
        assert_eq!(resolved, "ws://push.example.com/live");
    }

    #[test]
    fn https_origin_maps_to_wss() {
        let resolved = resolve(Some(&origin("https://push.example.com")), "/live").unwrap();
        assert_eq!(resolved, "wss://push.example.com/live");
    }

    #[test]
    fn query_string_passes_through_verbatim() {
        let resolved = resolve(
            Some(&origin("https://push.example.com")),
            "/live?room=7&ticket=a%20b",
        )
        .unwrap();
        assert_eq!(resolved, "wss://push.example.com/live?room=7&ticket=a%20b");
    }

    #[test]
    fn explicit_port_is_preserved() {
        let resolved = resolve(Some(&origin("http://127.0.0.1:8080")), "/live").unwrap();
        assert_eq!(resolved, "ws://127.0.0.1:8080/live");
    }

    #[test]
    fn default_port_is_elided() {
        let resolved = resolve(Some(&origin("https://push.example.com:443")), "/live").unwrap();
        assert_eq!(resolved, "wss://push.example.com/live");
    }

    #[test]
    fn absolute_ws_target_is_returned_unchanged() {
        let target = "ws://other.example.com/feed?x=1";
        let resolved = resolve(Some(&origin("https://push.example.com")), target).unwrap();
        assert_eq!(resolved, target);
    }

    #[test]
    fn absolute_wss_target_needs_no_origin() {
        let target = "wss://other.example.com/feed";
        assert_eq!(resolve(None, target).unwrap(), target);
    }

    #[test]
    fn resolution_is_idempotent() {
        let once = resolve(Some(&origin("http://push.example.com")), "/live?a=1").unwrap();
        let twice = resolve(Some(&origin("http://push.example.com")), &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn relative_target_without_origin_is_rejected() {
        let err = resolve(None, "/live").unwrap_err();
        assert!(err.to_string().contains("origin"));
    }

    #[test]
    fn non_http_origin_is_rejected() {
        let err = resolve(Some(&origin("ftp://push.example.com")), "/live").unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
