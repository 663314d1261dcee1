// This file is part of settlement-engine.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::{Mail, Mailer};
use fastrace::trace;
use reqwest::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use settlement_common::error::BoxError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,
    pub api_key: SecretString,
    pub from: String,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// A [Mailer] implementation posting mails to an HTTP mail relay.
#[derive(Debug, Clone)]
pub struct MailRelay {
    http: HttpClient,
    url: String,
    api_key: SecretString,
    from: String,
}

impl MailRelay {
    pub fn new(config: Config) -> Result<Self, MailRelayError> {
        let Config {
            url,
            api_key,
            from,
            request_timeout,
        } = config;

        let http = HttpClient::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(MailRelayError::Client)?;

        Ok(Self {
            http,
            url,
            api_key,
            from,
        })
    }
}

impl Mailer for MailRelay {
    #[trace]
    async fn send(&self, mail: &Mail) -> Result<(), BoxError> {
        let request = RelayRequest {
            from: &self.from,
            mail,
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("mail relay failed: {status} {text}").into());
        }

        Ok(())
    }
}

/// Error possibly returned by [MailRelay::new].
#[derive(Debug, Error)]
pub enum MailRelayError {
    #[error("cannot create HTTP client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from: &'a str,

    #[serde(flatten)]
    mail: &'a Mail,
}

#[cfg(test)]
mod tests {
    use crate::{domain::Mail, infra::mail_relay::RelayRequest};
    use serde_json::json;

    #[test]
    fn test_relay_request() {
        let mail = Mail {
            to: "guest@example.com".to_string(),
            subject: "Claim your tokens".to_string(),
            body: "https://example.com/claim?token=abc".to_string(),
        };

        let request = serde_json::to_value(RelayRequest {
            from: "noreply@example.com",
            mail: &mail,
        })
        .unwrap();
        assert_eq!(
            request,
            json!({
                "from": "noreply@example.com",
                "to": "guest@example.com",
                "subject": "Claim your tokens",
                "body": "https://example.com/claim?token=abc"
            })
        );
    }
}
