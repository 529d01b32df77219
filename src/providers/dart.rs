//! Korean disclosure system (DART) client
//!
//! DART authenticates with an API key passed as the `crtfc_key` query
//! parameter and reports business failures through a `status` code inside
//! HTTP 200 bodies. The key never appears in errors or logs.

use crate::{
    client::diagnostic_snippet,
    constants::{
        DART_API_URL, DART_ARCHIVE_TIMEOUT_SECS, DIAGNOSTIC_SNIPPET_LEN, REQUEST_TIMEOUT_SECS,
        USER_AGENT,
    },
    error::GatewayError,
    types::{CorpCode, StatementRow},
};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::{Cursor, Read};
use std::time::Duration;

/// Statement reports in the order they are tried, most complete first
pub const REPORTS: &[(&str, &str)] = &[
    ("11011", "Annual report"),
    ("11014", "Third-quarter report"),
    ("11012", "Half-year report"),
    ("11013", "First-quarter report"),
];

/// Statement divisions in the order they are tried
pub const FS_DIVISIONS: &[(&str, &str)] = &[("CFS", "Consolidated"), ("OFS", "Separate")];

const STATUS_OK: &str = "000";
const STATUS_NO_DATA: &str = "013";
const STATUS_RATE_LIMITED: &str = "020";

const SINGLE_FS_PATH: &str = "/fnlttSinglAcntAll.json";
const CORP_CODE_PATH: &str = "/corpCode.xml";
const CORP_CODE_ENTRY: &str = "CORPCODE.xml";

/// Error document DART returns instead of data
#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CorpCodeDocument {
    #[serde(default)]
    list: Vec<CorpCodeEntry>,
}

#[derive(Debug, Deserialize)]
struct CorpCodeEntry {
    #[serde(default)]
    corp_code: String,
    #[serde(default)]
    corp_name: String,
    #[serde(default)]
    stock_code: Option<String>,
}

/// Maps a DART status to an error; `None` for success and "no data"
fn status_error(status: &str, message: &str) -> Option<GatewayError> {
    match status {
        STATUS_OK | STATUS_NO_DATA => None,
        STATUS_RATE_LIMITED => Some(GatewayError::RateLimited),
        code => Some(GatewayError::UpstreamRejected {
            code: code.to_string(),
            message: message.trim().to_string(),
        }),
    }
}

fn text(row: &Value, field: &str) -> Option<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Amounts arrive as strings with thousands separators; `-` means none
fn amount(row: &Value, field: &str) -> Option<f64> {
    text(row, field)?.replace(',', "").parse().ok()
}

/// Normalizes the `list` of a single-company statement response
pub fn parse_statement_rows(body: &Value) -> Result<Vec<StatementRow>, GatewayError> {
    let rows = match body.get("list") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(rows)) => rows,
        Some(other) => {
            return Err(GatewayError::invalid_response(format!(
                "statement list is not an array: {other}"
            )))
        }
    };
    Ok(rows
        .iter()
        .map(|row| StatementRow {
            account_id: text(row, "account_id"),
            account_name: text(row, "account_nm"),
            current_amount: amount(row, "thstrm_amount"),
            prior_amount: amount(row, "frmtrm_amount"),
        })
        .collect())
}

/// Extracts listed companies from the corp-code archive
///
/// Companies without an exchange code are skipped; codes are zero-padded
/// to six digits.
pub fn parse_corp_code_archive(bytes: &[u8]) -> Result<Vec<CorpCode>, GatewayError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| GatewayError::invalid_response(format!("corp code archive: {e}")))?;
    let mut xml = String::new();
    archive
        .by_name(CORP_CODE_ENTRY)
        .map_err(|e| GatewayError::invalid_response(format!("corp code archive: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| GatewayError::invalid_response(format!("corp code archive: {e}")))?;

    let document: CorpCodeDocument = quick_xml::de::from_str(&xml)
        .map_err(|e| GatewayError::invalid_response(format!("corp code list: {e}")))?;

    Ok(document
        .list
        .into_iter()
        .filter_map(|entry| {
            let stock = entry.stock_code.as_deref().map(str::trim).unwrap_or_default();
            if stock.is_empty() {
                return None;
            }
            Some(CorpCode {
                corp_code: entry.corp_code.trim().to_string(),
                corp_name: entry.corp_name.trim().to_string(),
                stock_code: format!("{stock:0>6}"),
            })
        })
        .collect())
}

/// API-key client for the disclosure system
#[derive(Clone)]
pub struct DartClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for DartClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DartClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl DartClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GatewayError::config("DART API key cannot be empty"));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: DART_API_URL.to_string(),
            api_key,
        })
    }

    /// Points the client at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn snippet(&self, text: &str) -> String {
        diagnostic_snippet(&text.replace(&self.api_key, "[REDACTED]"), DIAGNOSTIC_SNIPPET_LEN)
    }

    async fn send(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&[("crtfc_key", self.api_key.as_str())])
            .query(query)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::unreachable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                self.snippet(&text)
            )));
        }
        Ok(response)
    }

    /// Full statement of one company for a report type and division
    ///
    /// An empty result means DART has no such statement.
    pub async fn single_fs(
        &self,
        corp_code: &str,
        year: i32,
        report_code: &str,
        fs_div: &str,
    ) -> Result<Vec<StatementRow>, GatewayError> {
        let query = [
            ("corp_code", corp_code.to_string()),
            ("bsns_year", year.to_string()),
            ("reprt_code", report_code.to_string()),
            ("fs_div", fs_div.to_string()),
        ];
        let response = self
            .send(SINGLE_FS_PATH, &query, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await?;
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::invalid_response(format!("{e}: {}", self.snippet(&text)))
        })?;

        let status = body.get("status").and_then(Value::as_str).unwrap_or_default();
        let message = body.get("message").and_then(Value::as_str).unwrap_or_default();
        if let Some(err) = status_error(status, message) {
            return Err(err);
        }
        if status == STATUS_NO_DATA {
            return Ok(Vec::new());
        }
        parse_statement_rows(&body)
    }

    /// Every listed company known to the disclosure system
    pub async fn corp_codes(&self) -> Result<Vec<CorpCode>, GatewayError> {
        let response = self
            .send(CORP_CODE_PATH, &[], Duration::from_secs(DART_ARCHIVE_TIMEOUT_SECS))
            .await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let bytes = response.bytes().await?;

        // DART answers errors with a 200 status document instead of the archive
        if !content_type.contains("zip") && !bytes.starts_with(b"PK") {
            let text = String::from_utf8_lossy(&bytes);
            let document = serde_json::from_str::<StatusDocument>(&text)
                .ok()
                .or_else(|| quick_xml::de::from_str::<StatusDocument>(&text).ok())
                .filter(|d| !d.status.is_empty());
            if let Some(err) = document.and_then(|d| status_error(&d.status, &d.message)) {
                return Err(err);
            }
            return Err(GatewayError::invalid_response(format!(
                "corp code list is not an archive: {}",
                self.snippet(&text)
            )));
        }

        tokio::task::spawn_blocking(move || parse_corp_code_archive(&bytes))
            .await
            .map_err(|e| GatewayError::invalid_response(format!("corp code parsing aborted: {e}")))?
    }
}
