use url::Url;

/// The request fields the engine needs to derive a cache key.
#[derive(Debug, Clone)]
pub struct RequestInfo {
  pub url: Url,
  pub method: String,
  /// Identifier of a resumable upload body; non-zero identifiers prefix the
  /// key so the cached response is tied to that body.
  pub upload_identifier: Option<i64>,
}

impl RequestInfo {
  pub fn new(url: Url, method: impl Into<String>) -> RequestInfo {
    RequestInfo {
      url,
      method: method.into(),
      upload_identifier: None,
    }
  }

  /// A plain GET request for `url`.
  pub fn get(url: Url) -> RequestInfo {
    RequestInfo::new(url, "GET")
  }
}

/// Canonical spelling of the URL for keying: fragment, username, and password
/// stripped.
pub(crate) fn spec_for_request(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  let _ = url.set_username("");
  let _ = url.set_password(None);
  url.into()
}

/// Key for NORMAL mode. No valid URL begins with a digit, so the
/// `<upload_id>/` prefix cannot collide with an unprefixed key.
pub(crate) fn normal_key(request: &RequestInfo) -> String {
  let url = spec_for_request(&request.url);
  match request.upload_identifier {
    Some(id) if id != 0 => format!("{id}/{url}"),
    _ => url,
  }
}

/// Key for PLAYBACK/RECORD mode: `<generation><method><url>`. The generation
/// counter distinguishes successive fetches of the same URL within a session.
pub(crate) fn playback_key(generation: u32, request: &RequestInfo) -> String {
  let url = spec_for_request(&request.url);
  format!("{generation}{}{url}", request.method)
}
