//! Token payloads returned by the backend auth endpoints.
//!
//! The backend answers login, register and refresh either with a flat
//! `{accessToken, refreshToken}` object or wrapped in a
//! `{success, data: {...}}` envelope. Both shapes are accepted.

use serde::Deserialize;

use crate::auth::Credential;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    #[serde(alias = "access_token", alias = "token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Envelope {
        success: bool,
        #[serde(default)]
        data: Option<TokenPair>,
        #[serde(default, alias = "error")]
        message: Option<String>,
    },
    Flat(TokenPair),
}

/// Parse a token response body into a credential.
///
/// When the server omits a new refresh token, `previous_refresh` is kept so a
/// refresh never loses the ability to refresh again.
pub(crate) fn parse_credential(
    body: &str,
    previous_refresh: Option<String>,
) -> Result<Credential, String> {
    let response: TokenResponse =
        serde_json::from_str(body).map_err(|e| format!("unrecognised token payload: {}", e))?;

    let pair = match response {
        TokenResponse::Flat(pair) => pair,
        TokenResponse::Envelope { success: true, data: Some(pair), .. } => pair,
        TokenResponse::Envelope { success: true, data: None, .. } => {
            return Err("envelope without data".to_string());
        }
        TokenResponse::Envelope { success: false, message, .. } => {
            return Err(message.unwrap_or_else(|| "request was not successful".to_string()));
        }
    };

    if pair.access_token.is_empty() {
        return Err("empty access token".to_string());
    }

    Ok(Credential {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token.or(previous_refresh),
    })
}
