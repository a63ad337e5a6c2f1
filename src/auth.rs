use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DriveError;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Refresh this early so an in-flight request never carries a dying token.
const EXPIRY_SLACK_SECS: i64 = 60;

/// On-disk token material, provisioned out of band (no interactive
/// consent flow lives in this daemon).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredToken {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    /// Epoch seconds when `access_token` stops being usable.
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

/// Token store with on-demand refresh through the OAuth2 endpoint.
pub struct Auth {
    path: PathBuf,
    http: reqwest::Client,
    state: Mutex<StoredToken>,
}

impl Auth {
    /// Loads the token file; the daemon refuses to start without one.
    pub fn load(path: PathBuf) -> Result<Self, DriveError> {
        let raw = fs::read(&path)?;
        let token: StoredToken = serde_json::from_slice(&raw).map_err(|e| {
            DriveError::PermissionDenied(format!("unreadable token file {}: {e}", path.display()))
        })?;
        Ok(Auth {
            path,
            http: reqwest::Client::new(),
            state: Mutex::new(token),
        })
    }

    /// Current bearer token. Refreshes when within a minute of expiry and
    /// persists the rotated token so the next start reuses it.
    pub async fn access_token(&self) -> Result<String, DriveError> {
        let mut token = self.state.lock().await;
        if !token.access_token.is_empty()
            && token.expires_at - EXPIRY_SLACK_SECS > Utc::now().timestamp()
        {
            return Ok(token.access_token.clone());
        }

        debug!("refreshing drive access token");
        let params = [
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
            ("refresh_token", token.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let res = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !res.status().is_success() {
            return Err(DriveError::PermissionDenied(format!(
                "token refresh rejected: HTTP {}",
                res.status()
            )));
        }

        let refreshed: RefreshResponse = res
            .json()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        token.access_token = refreshed.access_token;
        token.expires_at = Utc::now().timestamp() + refreshed.expires_in;
        self.persist(&token)?;
        info!("drive access token refreshed");

        Ok(token.access_token.clone())
    }

    fn persist(&self, token: &StoredToken) -> Result<(), DriveError> {
        let json = serde_json::to_vec_pretty(token).map_err(io::Error::other)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
