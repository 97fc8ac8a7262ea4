//! OAuth 刷新授权（refresh_token grant）

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::http::ApiClient;
use super::{TokenError, TokenGrant};
use crate::models::integration::{ConnectorConfig, Platform};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    /// Slack 风格的包络
    ok: Option<bool>,
    error: Option<String>,
}

/// 取出凭证包里的刷新令牌与 OAuth 客户端信息
pub fn refresh_credentials(
    platform: Platform,
    config: &ConnectorConfig,
) -> Result<(String, Option<String>, Option<String>), TokenError> {
    let refresh_token = config
        .refresh_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(TokenError::MissingRefreshToken(platform))?;
    let client_id = config.meta_str("client_id").map(|s| s.to_string());
    let client_secret = config.meta_str("client_secret").map(|s| s.to_string());
    Ok((refresh_token, client_id, client_secret))
}

/// 以表单方式请求令牌端点
pub async fn refresh_grant(
    api: &ApiClient,
    platform: Platform,
    token_url: &str,
    config: &ConnectorConfig,
) -> Result<TokenGrant, TokenError> {
    let (refresh_token, client_id, client_secret) = refresh_credentials(platform, config)?;

    let mut form: Vec<(&str, String)> = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token),
    ];
    if let Some(id) = client_id {
        form.push(("client_id", id));
    }
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }

    let url = api.url(token_url);
    let response: TokenResponse = api
        .json(|client| client.post(&url).form(&form))
        .await
        .map_err(|e| {
            warn!(platform = %platform, error = %e, "Token refresh request failed");
            TokenError::Rejected {
                platform,
                message: e.to_string(),
            }
        })?;

    if response.ok == Some(false) {
        return Err(TokenError::Rejected {
            platform,
            message: response.error.unwrap_or_else(|| "unknown_error".to_string()),
        });
    }

    let access_token = response.access_token.ok_or_else(|| TokenError::Rejected {
        platform,
        message: "token response did not contain an access token".to_string(),
    })?;

    info!(platform = %platform, "Access token refreshed");

    Ok(TokenGrant {
        access_token,
        refresh_token: response.refresh_token,
        expires_at: response.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_missing_refresh_token_fails_loudly() {
        let config = ConnectorConfig::new(Uuid::new_v4(), "token");
        let err = refresh_credentials(Platform::Jira, &config).unwrap_err();
        assert!(matches!(err, TokenError::MissingRefreshToken(Platform::Jira)));
    }
}
