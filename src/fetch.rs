use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::aggregate::PLATFORM_GROUP;
use crate::error::{FetchError, MalformedDataError};
use crate::models::{EngagementRecord, EntityKind, GroupTotal};

pub const AI_SERVICE_GROUP: &str = "ai-service";

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchPayload {
    Records(Vec<EngagementRecord>),
    Totals(Vec<GroupTotal>),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchPayload, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseDecoder {
    DashboardTotals,
    LiveSessions,
    Records,
    AiHealth,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardData {
    #[serde(default)]
    total_students: Option<usize>,
    #[serde(default)]
    overall_engagement: Option<f64>,
    #[serde(default)]
    classrooms: Vec<ClassroomRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassroomRow {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    student_count: usize,
    avg_engagement: f64,
}

#[derive(Deserialize)]
struct LiveData {
    sessions: Vec<LiveSessionRow>,
}

#[derive(Deserialize)]
struct LiveSessionRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    students: usize,
    engagement: f64,
}

#[derive(Deserialize)]
struct RecordsData {
    records: Vec<RawRecord>,
}

/// Backend engagement rows store the score as a 0–1 fraction.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    student_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    classroom_id: Option<String>,
    engagement_score: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    loaded: Option<bool>,
}

impl ResponseDecoder {
    pub fn decode(self, body: &str) -> Result<FetchPayload, FetchError> {
        match self {
            ResponseDecoder::DashboardTotals => {
                let data: DashboardData = unwrap_envelope(body)?;
                let mut totals: Vec<GroupTotal> = data
                    .classrooms
                    .iter()
                    .map(|c| GroupTotal {
                        group_key: c.id.clone(),
                        label: Some(
                            format!("{} {}", c.name, c.section.as_deref().unwrap_or(""))
                                .trim()
                                .to_string(),
                        ),
                        count: c.student_count,
                        mean: c.avg_engagement,
                    })
                    .collect();
                if let Some(overall) = data.overall_engagement {
                    let enrolled = data
                        .total_students
                        .unwrap_or_else(|| data.classrooms.iter().map(|c| c.student_count).sum());
                    totals.push(GroupTotal {
                        group_key: PLATFORM_GROUP.to_string(),
                        label: Some("All classes".to_string()),
                        count: enrolled,
                        mean: overall,
                    });
                }
                Ok(FetchPayload::Totals(totals))
            }
            ResponseDecoder::LiveSessions => {
                let data: LiveData = unwrap_envelope(body)?;
                Ok(FetchPayload::Totals(
                    data.sessions
                        .into_iter()
                        .map(|s| GroupTotal {
                            group_key: s.id,
                            label: s.name,
                            count: s.students,
                            mean: s.engagement,
                        })
                        .collect(),
                ))
            }
            ResponseDecoder::Records => {
                let data: RecordsData = unwrap_envelope(body)?;
                Ok(FetchPayload::Records(
                    data.records
                        .into_iter()
                        .map(|r| EngagementRecord {
                            classroom_id: r.classroom_id,
                            session_id: r.session_id,
                            ..EngagementRecord::new(
                                r.student_id,
                                EntityKind::Student,
                                r.engagement_score * 100.0,
                                r.timestamp,
                            )
                        })
                        .collect(),
                ))
            }
            ResponseDecoder::AiHealth => {
                let health: HealthBody =
                    serde_json::from_str(body).map_err(MalformedDataError::from)?;
                if health.status.is_none() && health.loaded.is_none() {
                    return Err(MalformedDataError::MissingField("status").into());
                }
                let online =
                    health.status.as_deref() == Some("ok") || health.loaded == Some(true);
                Ok(FetchPayload::Totals(vec![GroupTotal {
                    group_key: AI_SERVICE_GROUP.to_string(),
                    label: Some("AI inference service".to_string()),
                    count: 1,
                    mean: if online { 100.0 } else { 0.0 },
                }]))
            }
        }
    }
}

fn unwrap_envelope<T>(body: &str) -> Result<T, FetchError>
where
    T: for<'de> Deserialize<'de>,
{
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(MalformedDataError::from)?;
    if !envelope.success {
        return Err(FetchError::Rejected(
            envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| MalformedDataError::MissingField("data").into())
}

fn truncate_body(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

/// Polls one backend endpoint. The bearer token is passed in explicitly.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    decoder: ResponseDecoder,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        token: Option<String>,
        decoder: ResponseDecoder,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            token,
            decoder,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<FetchPayload, FetchError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate_body(&body, MAX_ERROR_BODY_CHARS),
            });
        }
        self.decoder.decode(&body)
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    entity_id: String,
    entity_kind: EntityKind,
    score: f64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    classroom_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Reads an engagement export with columns
/// `entity_id,entity_kind,score,timestamp,classroom_id,session_id`.
pub fn read_records_csv(path: &Path) -> Result<Vec<EngagementRecord>, FetchError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        if row.entity_id.trim().is_empty() {
            return Err(MalformedDataError::Row("entity_id must not be empty".to_string()).into());
        }
        records.push(EngagementRecord {
            classroom_id: row.classroom_id.filter(|v| !v.is_empty()),
            session_id: row.session_id.filter(|v| !v.is_empty()),
            ..EngagementRecord::new(row.entity_id, row.entity_kind, row.score, row.timestamp)
        });
    }

    Ok(records)
}

/// Re-reads a CSV export on every tick.
pub struct CsvFetcher {
    path: PathBuf,
}

impl CsvFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for CsvFetcher {
    async fn fetch(&self) -> Result<FetchPayload, FetchError> {
        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_records_csv(&path)).await??;
        Ok(FetchPayload::Records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_dashboard_classrooms_and_platform_total() {
        let body = r#"{
            "success": true,
            "message": "ok",
            "data": {
                "totalStudents": 40,
                "totalTeachers": 3,
                "activeSessions": 1,
                "overallEngagement": 71.5,
                "classrooms": [
                    {"_id": "c1", "name": "Physics", "section": "A", "teacherName": "R. Rao",
                     "studentCount": 25, "avgEngagement": 58, "sessionCount": 4},
                    {"_id": "c2", "name": "Chemistry", "studentCount": 15, "avgEngagement": 84.2}
                ]
            }
        }"#;
        let FetchPayload::Totals(totals) = ResponseDecoder::DashboardTotals.decode(body).unwrap()
        else {
            panic!("expected totals");
        };
        assert_eq!(totals.len(), 3);
        assert_eq!(totals[0].label.as_deref(), Some("Physics A"));
        assert_eq!(totals[0].count, 25);
        assert_eq!(totals[1].label.as_deref(), Some("Chemistry"));
        assert_eq!(totals[2].group_key, PLATFORM_GROUP);
        assert_eq!(totals[2].count, 40);
    }

    #[test]
    fn decodes_live_sessions() {
        let body = r#"{"success": true, "data": {"sessions": [
            {"id": "s1", "name": "Math — Algebra", "teacher": "A", "students": 30,
             "activeNow": 21, "engagement": 62, "status": "Good"}
        ]}}"#;
        let payload = ResponseDecoder::LiveSessions.decode(body).unwrap();
        assert_eq!(
            payload,
            FetchPayload::Totals(vec![GroupTotal {
                group_key: "s1".into(),
                label: Some("Math — Algebra".into()),
                count: 30,
                mean: 62.0,
            }])
        );
    }

    #[test]
    fn converts_fractional_record_scores_to_percent() {
        let body = r#"{"success": true, "data": {"records": [
            {"studentId": "u1", "sessionId": "s1", "classroomId": "c1",
             "engagementScore": 0.42, "timestamp": "2026-03-02T09:00:00Z"},
            {"studentId": "u2", "engagementScore": 1.3, "timestamp": "2026-03-02T09:00:03Z"}
        ]}}"#;
        let FetchPayload::Records(records) = ResponseDecoder::Records.decode(body).unwrap() else {
            panic!("expected records");
        };
        assert!((records[0].score - 42.0).abs() < 1e-9);
        assert_eq!(records[0].classroom_id.as_deref(), Some("c1"));
        assert_eq!(records[1].score, 100.0);
        assert_eq!(records[1].session_id, None);
    }

    #[test]
    fn health_maps_to_online_or_offline() {
        let online = ResponseDecoder::AiHealth
            .decode(r#"{"status": "ok", "model": "v3", "loaded": true}"#)
            .unwrap();
        let offline = ResponseDecoder::AiHealth
            .decode(r#"{"status": "down", "loaded": false}"#)
            .unwrap();
        let mean = |p: FetchPayload| match p {
            FetchPayload::Totals(t) => t[0].mean,
            FetchPayload::Records(_) => unreachable!(),
        };
        assert_eq!(mean(online), 100.0);
        assert_eq!(mean(offline), 0.0);
        assert!(ResponseDecoder::AiHealth.decode("{}").unwrap_err().is_malformed());
    }

    #[test]
    fn unsuccessful_envelope_is_a_fetch_failure_not_malformed() {
        let err = ResponseDecoder::LiveSessions
            .decode(r#"{"success": false, "message": "Access denied."}"#)
            .unwrap_err();
        assert!(matches!(err, FetchError::Rejected(ref m) if m == "Access denied."));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let no_data = ResponseDecoder::LiveSessions
            .decode(r#"{"success": true}"#)
            .unwrap_err();
        assert!(matches!(
            no_data,
            FetchError::Malformed(MalformedDataError::MissingField("data"))
        ));

        let bad_row = ResponseDecoder::LiveSessions
            .decode(r#"{"success": true, "data": {"sessions": [{"id": "s1"}]}}"#)
            .unwrap_err();
        assert!(bad_row.is_malformed());
        assert!(ResponseDecoder::Records.decode("<html>").unwrap_err().is_malformed());
    }

    const LIVE_BODY: &str = r#"{"success": true, "data": {"sessions": [
        {"id": "s1", "name": "Biology", "students": 12, "engagement": 48}
    ]}}"#;

    async fn spawn_backend() -> String {
        use axum::http::{header, HeaderMap, StatusCode};
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/api/session/live",
                get(|headers: HeaderMap| async move {
                    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                        Some("Bearer secret-token") => (StatusCode::OK, LIVE_BODY.to_string()),
                        _ => (StatusCode::UNAUTHORIZED, "Access denied.".to_string()),
                    }
                }),
            )
            .route(
                "/api/down",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "x".repeat(500)) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn http_fetcher_sends_bearer_token_and_decodes_envelope() {
        let base = spawn_backend().await;
        let url = format!("{base}/api/session/live");

        let authorized = HttpFetcher::new(
            client(),
            url.clone(),
            Some("secret-token".to_string()),
            ResponseDecoder::LiveSessions,
        );
        let FetchPayload::Totals(totals) = authorized.fetch().await.unwrap() else {
            panic!("expected totals");
        };
        assert_eq!(totals[0].group_key, "s1");
        assert_eq!(totals[0].mean, 48.0);

        let anonymous = HttpFetcher::new(client(), url, None, ResponseDecoder::LiveSessions);
        let err = anonymous.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn non_success_status_is_a_network_failure_with_truncated_body() {
        let base = spawn_backend().await;
        let fetcher = HttpFetcher::new(
            client(),
            format!("{base}/api/down"),
            None,
            ResponseDecoder::DashboardTotals,
        );
        let err = fetcher.fetch().await.unwrap_err();
        assert_eq!(err.kind(), "network");
        let FetchError::Status { status, body } = err else {
            panic!("expected a status error");
        };
        assert_eq!(status, 503);
        assert_eq!(body, format!("{}...", "x".repeat(MAX_ERROR_BODY_CHARS)));
    }

    #[test]
    fn truncates_long_error_bodies_on_char_boundaries() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("ééééé", 2), "éé...");
    }

    #[test]
    fn reads_csv_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(
            &path,
            "entity_id,entity_kind,score,timestamp,classroom_id,session_id\n\
             s1,student,72.5,2026-03-02T09:00:00Z,c1,\n\
             s2,student,120,2026-03-02T09:01:00Z,,sess-9\n",
        )
        .unwrap();
        let records = read_records_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].classroom_id.as_deref(), Some("c1"));
        assert_eq!(records[0].session_id, None);
        assert_eq!(records[1].score, 100.0);
        assert_eq!(records[1].session_id.as_deref(), Some("sess-9"));

        assert!(matches!(
            read_records_csv(&dir.path().join("missing.csv")),
            Err(FetchError::Io(_))
        ));
    }

    #[tokio::test]
    async fn csv_fetcher_reports_bad_rows_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(
            &path,
            "entity_id,entity_kind,score,timestamp,classroom_id,session_id\n\
             s1,teacher,50,2026-03-02T09:00:00Z,,\n",
        )
        .unwrap();
        let err = CsvFetcher::new(&path).fetch().await.unwrap_err();
        assert!(err.is_malformed());
    }
}
