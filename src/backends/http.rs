use serde::de::DeserializeOwned;

use crate::{Error, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Sends the request and maps any non-2xx status to [`Error::Api`] carrying
/// a bounded prefix of the response body.
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Api {
            status,
            body: truncate_body(text, MAX_ERROR_BODY_BYTES),
        });
    }
    Ok(response)
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    Ok(response.json::<T>().await?)
}

/// Error bodies are small JSON envelopes; anything bigger is cut at a char
/// boundary so the error message stays readable.
fn truncate_body(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...(truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_pass_through() {
        let body = "{\"msg\":\"denied\"}".to_string();
        assert_eq!(truncate_body(body.clone(), 64), body);
    }

    #[test]
    fn oversized_bodies_are_cut_at_a_char_boundary() {
        let body = "é".repeat(40);
        let cut = truncate_body(body, 11);
        assert!(cut.starts_with(&"é".repeat(5)));
        assert!(cut.ends_with("...(truncated)"));
    }
}
