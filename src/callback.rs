//! OAuth redirect handling and authorization-code exchange.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::SmartError;
use crate::logging;
use crate::storage::OAuthStateStore;
use crate::token::{request_token, Token, TokenLifecycleManager};
use crate::vendor::VendorContext;

/// Query parameters of the redirect back from the authorization server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of a completed callback
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub token: Token,
    pub vendor: VendorContext,
    pub launch_context: Option<String>,
    /// True when this was a repeat of an already handled callback
    pub replayed: bool,
}

/// Identity of the last exchanged code. Only a digest is kept.
struct Handled {
    code_digest: [u8; 32],
    vendor: VendorContext,
    launch_context: Option<String>,
}

pub struct CallbackHandler {
    http: reqwest::Client,
    attempts: OAuthStateStore,
    tokens: TokenLifecycleManager,
    clock: Arc<dyn Clock>,
    handled: Mutex<Option<Handled>>,
}

fn digest(code: &str) -> [u8; 32] {
    Sha256::digest(code.as_bytes()).into()
}

impl CallbackHandler {
    pub fn new(
        http: reqwest::Client,
        attempts: OAuthStateStore,
        tokens: TokenLifecycleManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            attempts,
            tokens,
            clock,
            handled: Mutex::new(None),
        }
    }

    /// Validate the redirect, exchange the code once and publish the token.
    ///
    /// A second call with an already exchanged code returns the current token
    /// without contacting the token endpoint again.
    pub async fn handle(&self, params: &CallbackParams) -> Result<CallbackOutcome, SmartError> {
        if let Some(error) = params.error.as_deref().filter(|e| !e.is_empty()) {
            let description = params
                .error_description
                .clone()
                .unwrap_or_else(|| "No description provided".to_string());
            logging::log_callback_rejected(error);
            self.attempts.delete()?;
            return Err(SmartError::AuthorizationDenied {
                error: error.to_string(),
                description,
            });
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                logging::log_callback_rejected("missing code");
                SmartError::TokenExchange("Authorization response is missing the code parameter".into())
            })?;

        // Serializes concurrent deliveries of the same redirect
        let mut handled = self.handled.lock().await;
        let code_digest = digest(code);
        if let Some(previous) = handled.as_ref().filter(|h| h.code_digest == code_digest) {
            if let Some(token) = self.tokens.current() {
                logging::log_callback_replayed();
                return Ok(CallbackOutcome {
                    token,
                    vendor: previous.vendor.clone(),
                    launch_context: previous.launch_context.clone(),
                    replayed: true,
                });
            }
        }

        let attempt = self.attempts.load()?;
        if params.state.as_deref() != Some(attempt.state.as_str()) {
            logging::log_callback_rejected("state mismatch");
            return Err(SmartError::StateMismatch);
        }
        if let Err(e) = self.attempts.ensure_fresh(&attempt) {
            logging::log_callback_rejected("attempt expired");
            self.attempts.delete()?;
            return Err(e);
        }

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", attempt.redirect_uri.as_str()),
            ("code_verifier", attempt.code_verifier.as_str()),
            ("client_id", self.tokens.client_id()),
        ];
        let response = request_token(&self.http, &attempt.token_endpoint, &form)
            .await
            .map_err(SmartError::TokenExchange)?;

        let vendor = VendorContext::from_issuer(&attempt.issuer);
        logging::log_token_exchanged(
            vendor.vendor,
            response.expires_in,
            response.refresh_token.is_some(),
        );
        let token = Token::from_response(response, self.clock.now());
        self.tokens.set_token(token.clone(), &attempt.token_endpoint);
        self.attempts.delete()?;

        *handled = Some(Handled {
            code_digest,
            vendor: vendor.clone(),
            launch_context: attempt.launch_context.clone(),
        });

        Ok(CallbackOutcome {
            token,
            vendor,
            launch_context: attempt.launch_context,
            replayed: false,
        })
    }
}
