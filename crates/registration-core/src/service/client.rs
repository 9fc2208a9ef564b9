//! HTTP implementation of the registration service endpoints.

use crate::attributes::AccountAttributes;
use crate::deps::{
    ChangeNumberRequest, RegistrationService, VerificationTransport, VerifiedAccount,
};
use crate::error::RegistrationError;
use crate::types::{AccountAuth, Aci, E164, Pni};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

/// Registration service client.
#[derive(Clone)]
pub struct HttpRegistrationService {
    client: Client,
    base_url: String,
}

impl HttpRegistrationService {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RegistrationError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                RegistrationError::NetworkFailure(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Map a non-success response to the typed error taxonomy.
    async fn error_for(response: Response) -> RegistrationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "service request failed");

        match status {
            StatusCode::PAYMENT_REQUIRED => RegistrationError::CaptchaRequired,
            StatusCode::FORBIDDEN => RegistrationError::InvalidVerificationCode,
            StatusCode::LOCKED => RegistrationError::RegistrationLocked,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYLOAD_TOO_LARGE => {
                RegistrationError::RateLimited
            }
            _ if body.contains("captcha") => RegistrationError::CaptchaRequired,
            _ => RegistrationError::HttpStatus(status.as_u16()),
        }
    }
}

/// Identifiers the server confirms a verification with.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifiedAccountResponse {
    aci: Aci,
    pni: Pni,
    #[serde(default = "default_device_id")]
    device_id: u32,
    auth_token: String,
}

fn default_device_id() -> u32 {
    crate::types::PRIMARY_DEVICE_ID
}

impl From<VerifiedAccountResponse> for VerifiedAccount {
    fn from(r: VerifiedAccountResponse) -> Self {
        VerifiedAccount {
            aci: r.aci,
            pni: r.pni,
            device_id: r.device_id,
            auth_token: r.auth_token,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_lock: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_base64")]
    name: Option<&'a [u8]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNumberBody<'a> {
    number: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_lock: Option<&'a str>,
    device_ids: &'a [u32],
}

mod opt_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<&[u8]>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }
}

#[async_trait]
impl RegistrationService for HttpRegistrationService {
    #[instrument(skip(self, captcha_token))]
    async fn request_verification_code(
        &self,
        e164: &E164,
        transport: VerificationTransport,
        captcha_token: Option<&str>,
    ) -> Result<(), RegistrationError> {
        let transport = match transport {
            VerificationTransport::Sms => "sms",
            VerificationTransport::Voice => "voice",
        };
        let mut url = format!(
            "{}/v1/verification/{}/code?transport={}",
            self.base_url,
            encode(e164.as_str()),
            transport
        );
        if let Some(token) = captcha_token {
            url = format!("{}&captcha={}", url, encode(token));
        }

        debug!(url = %url, "requesting verification code");
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }

    #[instrument(skip(self, code, reglock_token))]
    async fn confirm_verification_code(
        &self,
        e164: &E164,
        code: &str,
        reglock_token: Option<&str>,
    ) -> Result<VerifiedAccount, RegistrationError> {
        let url = format!(
            "{}/v1/verification/{}/verify/{}",
            self.base_url,
            encode(e164.as_str()),
            encode(code)
        );

        let response = self
            .client
            .post(&url)
            .json(&ConfirmBody {
                registration_lock: reglock_token,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let verified: VerifiedAccountResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::NetworkFailure(format!("malformed response: {e}")))?;
        Ok(verified.into())
    }

    #[instrument(skip(self, provisioning_code, encrypted_device_name))]
    async fn confirm_provisioning(
        &self,
        provisioning_code: &str,
        encrypted_device_name: Option<&[u8]>,
    ) -> Result<VerifiedAccount, RegistrationError> {
        let url = format!(
            "{}/v1/devices/provisioning/{}",
            self.base_url,
            encode(provisioning_code)
        );

        let response = self
            .client
            .post(&url)
            .json(&ProvisioningBody {
                name: encrypted_device_name,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let verified: VerifiedAccountResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::NetworkFailure(format!("malformed response: {e}")))?;
        Ok(verified.into())
    }

    #[instrument(skip_all)]
    async fn update_account_attributes(
        &self,
        attributes: &AccountAttributes,
        auth: &AccountAuth,
    ) -> Result<(), RegistrationError> {
        let url = format!("{}/v1/accounts/attributes", self.base_url);

        let response = self
            .client
            .put(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .json(attributes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        debug!("account attributes accepted");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn change_number(
        &self,
        request: &ChangeNumberRequest,
        auth: &AccountAuth,
    ) -> Result<VerifiedAccount, RegistrationError> {
        let url = format!("{}/v1/accounts/number", self.base_url);

        let response = self
            .client
            .put(&url)
            .basic_auth(&auth.username, Some(&auth.password))
            .json(&ChangeNumberBody {
                number: request.new_e164.as_str(),
                code: &request.verification_code,
                registration_lock: request.reglock_token.as_deref(),
                device_ids: &request.linked_device_ids,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let verified: VerifiedAccountResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::NetworkFailure(format!("malformed response: {e}")))?;
        Ok(verified.into())
    }
}
