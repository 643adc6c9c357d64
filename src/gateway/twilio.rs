//! Twilio-backed telephony gateway and live-call context injection.
//!
//! Calls go through the REST API: origination POSTs a Call resource and
//! then polls its status until the call is answered or fails. Injection
//! into a live call updates the Call resource with new TwiML, which Twilio
//! plays immediately. Text delivery posts a Message resource; chat medium
//! maps to WhatsApp addressing.

use std::env;
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AgentError, ConfigError, GatewayError};
use crate::gateway::{ConversationalAgent, TelephonyGateway};
use crate::model::{Medium, SessionId};

use async_trait::async_trait;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

// Twilio REST error codes this module reacts to.
const ERR_INVALID_TO_NUMBER: i64 = 21211;
const ERR_UNREACHABLE_NUMBER: i64 = 21614;
const ERR_CALL_NOT_IN_PROGRESS: i64 = 21220;

/// Twilio credentials and addressing, loaded from the environment.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    /// Overridable for tests pointed at a local mock server.
    pub api_base: String,
    /// Public base URL for status callbacks, if webhooks are reachable.
    pub callback_base: Option<String>,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            account_sid: require_env("TWILIO_ACCOUNT_SID")?,
            auth_token: SecretString::from(require_env("TWILIO_AUTH_TOKEN")?),
            from_number: require_env("TWILIO_PHONE_NUMBER")?,
            api_base: env::var("TWILIO_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            callback_base: env::var("WEBHOOK_BASE_URL").ok(),
        })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        )
    }

    fn call_url(&self, sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{sid}.json",
            self.api_base, self.account_sid
        )
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<i64>,
    message: Option<String>,
}

/// Where a Twilio call status leaves the origination attempt.
#[derive(Debug, PartialEq, Eq)]
enum CallProgress {
    /// Call was answered (or already ran to completion).
    Connected,
    /// Still queued, ringing, or initiating. Keep polling.
    Pending,
    /// Call will not connect.
    Failed(&'static str),
}

fn classify_call_status(status: &str) -> CallProgress {
    match status {
        "in-progress" | "completed" => CallProgress::Connected,
        "queued" | "initiated" | "ringing" => CallProgress::Pending,
        "busy" => CallProgress::Failed("busy"),
        "no-answer" => CallProgress::Failed("no-answer"),
        // "failed", "canceled", and anything Twilio adds later.
        _ => CallProgress::Failed("failed"),
    }
}

/// Minimal TwiML escaping for text placed inside a <Say> verb.
fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// TwiML that speaks `text` and then holds the line open for a reply.
fn say_twiml(text: &str) -> String {
    format!(
        "<Response><Say voice=\"Polly.Joanna\">{}</Say><Pause length=\"60\"/></Response>",
        xml_escape(text)
    )
}

/// Twilio addresses WhatsApp targets with a scheme-like prefix.
fn address_for(medium: Medium, number: &str) -> String {
    match medium {
        Medium::Chat => format!("whatsapp:{number}"),
        Medium::Call | Medium::Sms => number.to_string(),
    }
}

fn transport_err(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

/// Map a non-2xx Twilio response to a gateway error.
async fn api_error(response: reqwest::Response, target: &str) -> GatewayError {
    let status = response.status();
    let body: ApiError = match response.json().await {
        Ok(body) => body,
        Err(e) => return transport_err(e),
    };
    match body.code {
        Some(ERR_INVALID_TO_NUMBER) | Some(ERR_UNREACHABLE_NUMBER) => GatewayError::InvalidTarget {
            target: target.to_string(),
        },
        _ => GatewayError::Transport(format!(
            "Twilio returned {status}: {}",
            body.message.unwrap_or_else(|| "unknown error".into())
        )),
    }
}

/// Telephony gateway over the Twilio REST API.
pub struct TwilioGateway {
    http: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioGateway {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Poll the call resource until it connects or fails. The caller bounds
    /// this with a timeout; we only stop on a definitive status.
    async fn await_connection(&self, sid: &str) -> Result<(), GatewayError> {
        loop {
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;

            let response = self
                .http
                .get(self.config.call_url(sid))
                .basic_auth(
                    &self.config.account_sid,
                    Some(self.config.auth_token.expose_secret()),
                )
                .send()
                .await
                .map_err(transport_err)?;

            if !response.status().is_success() {
                return Err(GatewayError::Transport(format!(
                    "Call status fetch failed with {}",
                    response.status()
                )));
            }

            let call: CallResource = response.json().await.map_err(transport_err)?;
            debug!(sid, status = %call.status, "Polled call status");

            match classify_call_status(&call.status) {
                CallProgress::Connected => return Ok(()),
                CallProgress::Pending => continue,
                CallProgress::Failed("busy") => return Err(GatewayError::Busy),
                CallProgress::Failed("no-answer") => return Err(GatewayError::NoAnswer),
                CallProgress::Failed(reason) => {
                    return Err(GatewayError::Transport(format!("call {reason}")));
                }
            }
        }
    }
}

#[async_trait]
impl TelephonyGateway for TwilioGateway {
    async fn originate_session(
        &self,
        target: &str,
        announcement: &str,
    ) -> Result<SessionId, GatewayError> {
        let mut form = vec![
            ("To".to_string(), target.to_string()),
            ("From".to_string(), self.config.from_number.clone()),
            ("Twiml".to_string(), say_twiml(announcement)),
        ];
        if let Some(base) = &self.config.callback_base {
            form.push(("StatusCallback".into(), format!("{base}/webhook/status")));
            form.push(("StatusCallbackEvent".into(), "answered completed".into()));
        }

        let response = self
            .http
            .post(self.config.calls_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(transport_err)?;

        if !response.status().is_success() {
            return Err(api_error(response, target).await);
        }

        let call: CallResource = response.json().await.map_err(transport_err)?;
        info!(sid = %call.sid, target, "Originated call");

        self.await_connection(&call.sid).await?;
        Ok(SessionId::new(call.sid))
    }

    async fn deliver_text(
        &self,
        target: &str,
        medium: Medium,
        body: &str,
    ) -> Result<SessionId, GatewayError> {
        let form = [
            ("To".to_string(), address_for(medium, target)),
            ("From".to_string(), address_for(medium, &self.config.from_number)),
            ("Body".to_string(), body.to_string()),
        ];

        let response = self
            .http
            .post(self.config.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(transport_err)?;

        if !response.status().is_success() {
            return Err(api_error(response, target).await);
        }

        let message: MessageResource = response.json().await.map_err(transport_err)?;
        info!(sid = %message.sid, medium = medium.as_str(), "Delivered text");
        Ok(SessionId::new(message.sid))
    }
}

/// Context injection via live-call TwiML replacement.
pub struct TwilioAgent {
    http: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioAgent {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ConversationalAgent for TwilioAgent {
    async fn inject_context(
        &self,
        session_id: &SessionId,
        announcement: &str,
    ) -> Result<(), AgentError> {
        let form = [("Twiml".to_string(), say_twiml(announcement))];

        let response = self
            .http
            .post(self.config.call_url(session_id.as_str()))
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            info!(session = %session_id, "Injected announcement into live call");
            return Ok(());
        }

        let status = response.status();
        let body: ApiError = response
            .json()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;

        // Updating a call that already hung up is the expected race, not an
        // outage.
        if status == StatusCode::NOT_FOUND || body.code == Some(ERR_CALL_NOT_IN_PROGRESS) {
            warn!(session = %session_id, "Call ended before injection");
            return Err(AgentError::SessionClosed {
                session_id: session_id.to_string(),
            });
        }

        Err(AgentError::Unavailable(format!(
            "Twilio returned {status}: {}",
            body.message.unwrap_or_else(|| "unknown error".into())
        )))
    }
}
