use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytes::ByteCounters;
use crate::errors::ErrContext;
use crate::net::{trim_trailing_slashes, HttpClient, CONTROL_TIMEOUT};

/// Version of the report data format spoken with the collector.
const DATA_FORMAT_VERSION: &str = "0.2.0";

/// Metadata sent when opening a report.
#[derive(Debug, Serialize)]
pub struct OpenReportRequest<'a> {
    pub data_format_version: &'static str,
    pub format: &'static str,
    pub input_hashes: [&'static str; 0],
    pub probe_asn: &'a str,
    pub probe_cc: &'a str,
    pub software_name: &'a str,
    pub software_version: &'a str,
    pub test_name: &'a str,
    pub test_start_time: &'a str,
    pub test_version: &'a str,
}

impl<'a> OpenReportRequest<'a> {
    pub fn new(
        probe_asn: &'a str,
        probe_cc: &'a str,
        software_name: &'a str,
        software_version: &'a str,
        test_name: &'a str,
        test_start_time: &'a str,
        test_version: &'a str,
    ) -> Self {
        Self {
            data_format_version: DATA_FORMAT_VERSION,
            format: "json",
            input_hashes: [],
            probe_asn,
            probe_cc,
            software_name,
            software_version,
            test_name,
            test_start_time,
            test_version,
        }
    }
}

#[derive(Deserialize)]
struct OpenReportReply {
    report_id: String,
}

#[derive(Serialize)]
struct UpdateReportRequest<'a> {
    content: &'a str,
    format: &'static str,
}

/// Open a report, returning the collector-assigned report id.
pub async fn open_report(
    http: &HttpClient,
    base_url: &str,
    request: &OpenReportRequest<'_>,
    counters: &ByteCounters,
) -> Result<String, ErrContext> {
    let body = serde_json::to_string(request).map_err(|e| ErrContext::json(&e))?;
    let url = format!("{}/report", trim_trailing_slashes(base_url));
    debug!(url, body, "opening report");

    let reply = http.post_json(&url, body, CONTROL_TIMEOUT, counters).await?;
    debug!(reply, "open report reply");

    let reply: OpenReportReply =
        serde_json::from_str(&reply).map_err(|e| ErrContext::json(&e))?;
    Ok(reply.report_id)
}

/// Append one serialized measurement to an open report.
///
/// `measurement_json` is submitted byte-for-byte as the `content` field.
pub async fn update_report(
    http: &HttpClient,
    base_url: &str,
    report_id: &str,
    measurement_json: &str,
    counters: &ByteCounters,
) -> Result<(), ErrContext> {
    let body = serde_json::to_string(&UpdateReportRequest {
        content: measurement_json,
        format: "json",
    })
    .map_err(|e| ErrContext::json(&e))?;

    let url = format!("{}/report/{report_id}", trim_trailing_slashes(base_url));
    debug!(url, "updating report");

    http.post_json(&url, body, CONTROL_TIMEOUT, counters).await?;
    Ok(())
}

/// Close a report.
pub async fn close_report(
    http: &HttpClient,
    base_url: &str,
    report_id: &str,
    counters: &ByteCounters,
) -> Result<(), ErrContext> {
    let url = format!(
        "{}/report/{report_id}/close",
        trim_trailing_slashes(base_url)
    );
    debug!(url, "closing report");

    http.post_json(&url, String::new(), CONTROL_TIMEOUT, counters)
        .await?;
    Ok(())
}
