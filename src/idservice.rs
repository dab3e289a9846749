use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::{IdKind, StableId};
use crate::error::KiraError;

/// External store of stable identifiers.
pub trait IdentityService: Send + Sync {
    fn lookup(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<Option<StableId>, KiraError>;
    fn create(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<StableId, KiraError>;
    /// Legacy barcode to UUID.
    fn translate_barcode(&self, barcode: &str) -> Result<Option<String>, KiraError>;
    /// UUID to legacy barcode.
    fn translate_uuid(&self, uuid: &str) -> Result<Option<String>, KiraError>;
}

/// Submitted donor ids already known to the harmonization study and to the clinical registry.
pub trait DonorRegistry: Send + Sync {
    fn harmonized_submitted_donors(&self) -> Result<HashSet<String>, KiraError>;
    fn registered_submitted_donors(&self) -> Result<HashSet<String>, KiraError>;
}

#[derive(Clone)]
pub struct HttpIdentityClient {
    client: Client,
    base_url: String,
    barcode_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranslationResponse {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    barcode: Option<String>,
}

impl HttpIdentityClient {
    pub fn new(
        base_url: &str,
        barcode_url: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-repo/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::IdentityHttp(err.to_string()))?,
        );
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| KiraError::IdentityHttp(err.to_string()))?,
            );
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::IdentityHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            barcode_url: barcode_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn id_url(&self, kind: IdKind) -> String {
        format!("{}/{}/id", self.base_url, kind.as_str())
    }

    fn request_id(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
        create: bool,
    ) -> Result<Option<StableId>, KiraError> {
        let url = self.id_url(kind);
        let create = if create { "true" } else { "false" };
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[
                ("submittedId", submitted_id),
                ("submittedProjectId", project_code),
                ("create", create),
            ])
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = handle_status(response, |status, message| KiraError::IdentityStatus {
            status,
            message,
        })?;
        let body = response
            .text()
            .map_err(|err| KiraError::IdentityHttp(err.to_string()))?;
        let id = body.trim();
        Ok((!id.is_empty()).then(|| StableId::new(id)))
    }

    fn translate(&self, path: &str, id: &str) -> Result<Option<TranslationResponse>, KiraError> {
        let Some(base) = &self.barcode_url else {
            return Ok(None);
        };
        let url = format!("{base}/{path}/{id}");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = handle_status(response, |status, message| KiraError::BarcodeStatus {
            status,
            message,
        })?;
        let parsed = response
            .json::<TranslationResponse>()
            .map_err(|err| KiraError::BarcodeHttp(err.to_string()))?;
        Ok(Some(parsed))
    }

    fn fetch_donor_set(&self, path: &str) -> Result<HashSet<String>, KiraError> {
        let url = format!("{}/donors/{path}", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let response = handle_status(response, |status, message| KiraError::IdentityStatus {
            status,
            message,
        })?;
        let ids = response
            .json::<Vec<String>>()
            .map_err(|err| KiraError::IdentityHttp(err.to_string()))?;
        Ok(ids.into_iter().collect())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::IdentityHttp(err.to_string()));
                }
            }
        }
    }
}

impl IdentityService for HttpIdentityClient {
    fn lookup(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<Option<StableId>, KiraError> {
        self.request_id(kind, submitted_id, project_code, false)
    }

    fn create(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<StableId, KiraError> {
        self.request_id(kind, submitted_id, project_code, true)?
            .ok_or_else(|| {
                KiraError::IdentityHttp(format!(
                    "{kind} id creation returned no id for {project_code}/{submitted_id}"
                ))
            })
    }

    fn translate_barcode(&self, barcode: &str) -> Result<Option<String>, KiraError> {
        Ok(self.translate("barcode", barcode)?.and_then(|found| found.uuid))
    }

    fn translate_uuid(&self, uuid: &str) -> Result<Option<String>, KiraError> {
        Ok(self.translate("uuid", uuid)?.and_then(|found| found.barcode))
    }
}

impl DonorRegistry for HttpIdentityClient {
    fn harmonized_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        self.fetch_donor_set("harmonized")
    }

    fn registered_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        self.fetch_donor_set("registered")
    }
}

/// Stand-in used when no identity service is configured: nothing resolves, nothing is minted.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineIdentity;

impl IdentityService for OfflineIdentity {
    fn lookup(
        &self,
        _kind: IdKind,
        _submitted_id: &str,
        _project_code: &str,
    ) -> Result<Option<StableId>, KiraError> {
        Ok(None)
    }

    fn create(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<StableId, KiraError> {
        Err(KiraError::IdentityHttp(format!(
            "identity service not configured; cannot create {kind} id for {project_code}/{submitted_id}"
        )))
    }

    fn translate_barcode(&self, _barcode: &str) -> Result<Option<String>, KiraError> {
        Ok(None)
    }

    fn translate_uuid(&self, _uuid: &str) -> Result<Option<String>, KiraError> {
        Ok(None)
    }
}

impl DonorRegistry for OfflineIdentity {
    fn harmonized_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        Ok(HashSet::new())
    }

    fn registered_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        Ok(HashSet::new())
    }
}

fn handle_status<F>(response: Response, to_error: F) -> Result<Response, KiraError>
where
    F: FnOnce(u16, String) -> KiraError,
{
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "identity request failed".to_string());
    Err(to_error(status, message))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_url_per_kind() {
        let client = HttpIdentityClient::new("https://id.example.org/api/", None, None).unwrap();
        assert_eq!(
            client.id_url(IdKind::Specimen),
            "https://id.example.org/api/specimen/id"
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }
}
