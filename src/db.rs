use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::FetchError;
use crate::fetch::{FetchPayload, Fetcher};
use crate::models::{EngagementRecord, EntityKind};

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

fn records_query(classroom: Option<&str>) -> String {
    let mut query = String::from(
        "SELECT student_id, classroom_id, session_id, engagement_score, recorded_at \
         FROM engagement_records \
         WHERE recorded_at >= $1",
    );

    if classroom.is_some() {
        query.push_str(" AND classroom_id = $2");
    }

    query
}

/// Reads the recent engagement rows the backend writes (scores stored 0–1).
pub async fn fetch_records(
    pool: &PgPool,
    since: DateTime<Utc>,
    classroom: Option<&str>,
) -> Result<Vec<EngagementRecord>, sqlx::Error> {
    let query = records_query(classroom);
    let mut rows = sqlx::query(&query).bind(since);

    if let Some(value) = classroom {
        rows = rows.bind(value);
    }

    let mut records = Vec::new();
    for row in rows.fetch_all(pool).await? {
        let score: f64 = row.try_get("engagement_score")?;
        records.push(EngagementRecord {
            classroom_id: row.try_get("classroom_id")?,
            session_id: row.try_get("session_id")?,
            ..EngagementRecord::new(
                row.try_get::<String, _>("student_id")?,
                EntityKind::Student,
                score * 100.0,
                row.try_get("recorded_at")?,
            )
        });
    }

    Ok(records)
}

pub struct PgFetcher {
    pool: PgPool,
    lookback: Duration,
    classroom: Option<String>,
}

impl PgFetcher {
    pub fn new(pool: PgPool, lookback: Duration, classroom: Option<String>) -> Self {
        Self {
            pool,
            lookback,
            classroom,
        }
    }
}

#[async_trait]
impl Fetcher for PgFetcher {
    async fn fetch(&self) -> Result<FetchPayload, FetchError> {
        let since = Utc::now() - self.lookback;
        let records = fetch_records(&self.pool, since, self.classroom.as_deref()).await?;
        Ok(FetchPayload::Records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classroom_filter_adds_second_bind() {
        let all = records_query(None);
        assert!(all.ends_with("WHERE recorded_at >= $1"));
        assert!(!all.contains("$2"));

        let scoped = records_query(Some("c1"));
        assert!(scoped.ends_with("AND classroom_id = $2"));
    }
}
