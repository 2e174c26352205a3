// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AWS sourced subject tokens.
//!
//! A workload running on AWS proves its identity to the Security Token
//! Service by presenting a [SigV4] signed `GetCallerIdentity` request,
//! serialized into a JSON envelope. The temporary signing credentials come
//! from the EC2 instance metadata service (IMDSv2), or from the standard
//! AWS environment variables.
//!
//! [SigV4]: https://docs.aws.amazon.com/IAM/latest/UserGuide/create-signed-request.html

use crate::credentials::subject_token::{
    Builder as SubjectTokenBuilder, SubjectToken, SubjectTokenProvider,
};
use crate::errors;
use crate::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use ring::{digest, hmac};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

const IMDS_TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const IMDS_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const TARGET_RESOURCE_HEADER: &str = "x-goog-cloud-target-resource";
const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "sts";

// The unreserved characters of RFC 3986; everything else is escaped.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The `credential_source` fields of an AWS external account.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct AwsCredentialSource {
    pub(crate) environment_id: String,
    pub(crate) region_url: Option<String>,
    pub(crate) url: Option<String>,
    pub(crate) regional_cred_verification_url: String,
    pub(crate) imdsv2_session_token_url: Option<String>,
}

#[derive(Clone, Debug)]
pub(crate) struct AwsSourcedCredentials {
    pub(crate) source: AwsCredentialSource,
    pub(crate) audience: String,
}

#[derive(Debug, Deserialize)]
struct AwsSecurityCredentialsResponse {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "Token")]
    token: Option<String>,
}

struct AwsSecurityCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

/// The envelope presented to the Security Token Service as the subject
/// token.
#[derive(Debug, Deserialize, Serialize)]
struct CallerIdentityEnvelope {
    url: String,
    method: String,
    headers: Vec<EnvelopeHeader>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EnvelopeHeader {
    key: String,
    value: String,
}

#[async_trait::async_trait]
impl SubjectTokenProvider for AwsSourcedCredentials {
    async fn subject_token(&self) -> Result<SubjectToken> {
        let client = Client::new();
        let imds_token = self.imds_session_token(&client).await?;
        let region = self.region(&client, imds_token.as_deref()).await?;
        let credentials = self
            .security_credentials(&client, imds_token.as_deref())
            .await?;
        let envelope = self.signed_caller_identity(&region, &credentials, OffsetDateTime::now_utc())?;
        let json = serde_json::to_string(&envelope).map_err(errors::serialization)?;
        let token = utf8_percent_encode(&json, URI_ENCODE_SET).to_string();
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

impl AwsSourcedCredentials {
    async fn imds_session_token(&self, client: &Client) -> Result<Option<String>> {
        let Some(url) = &self.source.imdsv2_session_token_url else {
            return Ok(None);
        };
        let response = client
            .put(url)
            .header(IMDS_TOKEN_TTL_HEADER, "300")
            .send()
            .await
            .map_err(errors::retryable)?;
        if !response.status().is_success() {
            return Err(errors::non_retryable_from_str(format!(
                "failed to fetch an IMDSv2 session token: status {}",
                response.status()
            )));
        }
        response.text().await.map_err(errors::retryable).map(Some)
    }

    async fn region(&self, client: &Client, imds_token: Option<&str>) -> Result<String> {
        for var in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
            if let Ok(region) = std::env::var(var) {
                if !region.is_empty() {
                    return Ok(region);
                }
            }
        }
        let Some(url) = &self.source.region_url else {
            return Err(errors::non_retryable_from_str(
                "no AWS region: neither AWS_REGION, AWS_DEFAULT_REGION, nor a `region_url` is configured",
            ));
        };
        let mut request = client.get(url);
        if let Some(token) = imds_token {
            request = request.header(IMDS_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(errors::retryable)?;
        if !response.status().is_success() {
            return Err(errors::non_retryable_from_str(format!(
                "failed to fetch the AWS region: status {}",
                response.status()
            )));
        }
        let zone = response.text().await.map_err(errors::retryable)?;
        // The endpoint returns an availability zone, e.g. `us-east-1b`;
        // the region is the zone minus its trailing letter.
        let region = match zone.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => zone[..zone.len() - 1].to_string(),
            _ => zone,
        };
        Ok(region)
    }

    async fn security_credentials(
        &self,
        client: &Client,
        imds_token: Option<&str>,
    ) -> Result<AwsSecurityCredentials> {
        if let (Ok(access_key_id), Ok(secret_access_key)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            if !access_key_id.is_empty() && !secret_access_key.is_empty() {
                return Ok(AwsSecurityCredentials {
                    access_key_id,
                    secret_access_key,
                    session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
                });
            }
        }
        let Some(url) = &self.source.url else {
            return Err(errors::non_retryable_from_str(
                "no AWS security credentials: neither the environment variables nor a credentials `url` is configured",
            ));
        };
        let role = self.imds_get(client, url, imds_token).await?;
        let body = self
            .imds_get(client, &format!("{}/{}", url.trim_end_matches('/'), role.trim()), imds_token)
            .await?;
        let response: AwsSecurityCredentialsResponse =
            serde_json::from_str(&body).map_err(errors::serialization)?;
        Ok(AwsSecurityCredentials {
            access_key_id: response.access_key_id,
            secret_access_key: response.secret_access_key,
            session_token: response.token,
        })
    }

    async fn imds_get(
        &self,
        client: &Client,
        url: &str,
        imds_token: Option<&str>,
    ) -> Result<String> {
        let mut request = client.get(url);
        if let Some(token) = imds_token {
            request = request.header(IMDS_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(errors::retryable)?;
        if !response.status().is_success() {
            return Err(errors::non_retryable_from_str(format!(
                "failed to fetch `{url}`: status {}",
                response.status()
            )));
        }
        response.text().await.map_err(errors::retryable)
    }

    /// Builds the SigV4 signed `GetCallerIdentity` envelope.
    fn signed_caller_identity(
        &self,
        region: &str,
        credentials: &AwsSecurityCredentials,
        now: OffsetDateTime,
    ) -> Result<CallerIdentityEnvelope> {
        let url_str = self
            .source
            .regional_cred_verification_url
            .replace("{region}", region);
        let url = reqwest::Url::parse(&url_str).map_err(errors::non_retryable)?;
        let host = url
            .host_str()
            .ok_or_else(|| errors::non_retryable_from_str("the verification URL has no host"))?
            .to_string();

        let amz_date = now
            .format(format_description!(
                "[year][month][day]T[hour][minute][second]Z"
            ))
            .map_err(errors::non_retryable)?;
        let date_stamp = now
            .format(format_description!("[year][month][day]"))
            .map_err(errors::non_retryable)?;

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host),
            ("x-amz-date".to_string(), amz_date.clone()),
            (
                TARGET_RESOURCE_HEADER.to_string(),
                self.audience.clone(),
            ),
        ];
        if let Some(token) = &credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let mut query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        query.sort();
        let canonical_query = query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, URI_ENCODE_SET),
                    utf8_percent_encode(v, URI_ENCODE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex(digest::digest(&digest::SHA256, b"").as_ref());
        let canonical_request = format!(
            "POST\n{}\n{}\n{}\n{}\n{}",
            url.path(),
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
        let string_to_sign = format!(
            "{SIGNING_ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
            hex(digest::digest(&digest::SHA256, canonical_request.as_bytes()).as_ref())
        );

        let k_secret = format!("AWS4{}", credentials.secret_access_key);
        let k_date = hmac_sign(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sign(&k_date, region.as_bytes());
        let k_service = hmac_sign(&k_region, SERVICE.as_bytes());
        let k_signing = hmac_sign(&k_service, b"aws4_request");
        let signature = hex(&hmac_sign(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "{SIGNING_ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        );

        let mut envelope_headers = headers;
        envelope_headers.push(("Authorization".to_string(), authorization));
        Ok(CallerIdentityEnvelope {
            url: url_str,
            method: "POST".to_string(),
            headers: envelope_headers
                .into_iter()
                .map(|(key, value)| EnvelopeHeader { key, value })
                .collect(),
        })
    }
}

fn hmac_sign(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
