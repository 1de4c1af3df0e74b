//! Session login against `/~/login`.

use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use tracing::info;
use url::{form_urlencoded, Url};

use super::error::{Error, Result};

/// Log in with the ship's `+code` and return a `Cookie` header value.
pub async fn login(http: &reqwest::Client, base: &Url, code: &str) -> Result<String> {
    let url = base.join("/~/login")?;
    let body = form_urlencoded::Serializer::new(String::new())
        .append_pair("password", code)
        .finish();

    let response = http
        .post(url.clone())
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Login(format!("{status} from {url}")));
    }

    let cookie = cookie_header(
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );
    if cookie.is_empty() {
        return Err(Error::Login("no session cookie in response".to_string()));
    }

    info!(url = %url, "logged in to ship");
    Ok(cookie)
}

/// Build a `Cookie` header from `Set-Cookie` values, keeping only `name=value`.
pub fn cookie_header<'a>(set_cookies: impl IntoIterator<Item = &'a str>) -> String {
    set_cookies
        .into_iter()
        .filter_map(|c| c.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}
