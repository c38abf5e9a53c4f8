//! Readiness probe answered locally, without contacting the backend

use crate::error::{full_body, ProxyBody};
use crate::readiness::ReadinessGate;
use chrono::{SecondsFormat, Utc};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Starting,
}

/// JSON body of the probe response
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    pub timestamp: String,
}

impl ProbeReport {
    pub fn from_gate(gate: &ReadinessGate) -> Self {
        let status = if gate.is_ready() {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Starting
        };
        Self {
            status,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.status {
            ProbeStatus::Ok => StatusCode::OK,
            ProbeStatus::Starting => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Build the probe response: 200 once the backend is ready, 503 before that
pub fn probe_response(gate: &ReadinessGate) -> Response<ProxyBody> {
    let report = ProbeReport::from_gate(gate);
    let body = serde_json::to_string(&report).unwrap_or_else(|_| {
        format!(
            r#"{{"status":"{}","timestamp":"{}"}}"#,
            match report.status {
                ProbeStatus::Ok => "ok",
                ProbeStatus::Starting => "starting",
            },
            report.timestamp
        )
    });

    Response::builder()
        .status(report.status_code())
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}
