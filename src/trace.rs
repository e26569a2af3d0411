//! Durable query traces.
//!
//! Exactly one trace is recorded per completed query, after the final
//! pipeline step. Traces are append-only: nothing in the system updates a
//! trace once written. Metrics and steps are stored as JSON columns so the
//! trace survives schema drift in the step details.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{PipelineStep, QueryMetrics, Trace};

/// Writes and reads the `traces` table.
pub struct TraceRecorder {
    pool: SqlitePool,
}

impl TraceRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist one completed query. Returns the trace id.
    pub async fn record(
        &self,
        prompt: &str,
        answer: &str,
        metrics: &QueryMetrics,
        steps: &[PipelineStep],
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let metrics_json =
            serde_json::to_string(metrics).context("Failed to serialize trace metrics")?;
        let steps_json =
            serde_json::to_string(steps).context("Failed to serialize trace steps")?;

        sqlx::query(
            "INSERT INTO traces (id, recorded_at, prompt, answer, metrics_json, steps_json) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(Utc::now().timestamp_millis())
        .bind(prompt)
        .bind(answer)
        .bind(metrics_json)
        .bind(steps_json)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// All traces, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Trace>> {
        let rows = sqlx::query(
            "SELECT id, recorded_at, prompt, answer, metrics_json, steps_json \
             FROM traces ORDER BY recorded_at DESC, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trace).collect()
    }

    /// Fetch one trace by id.
    pub async fn get(&self, id: &str) -> Result<Option<Trace>> {
        let row = sqlx::query(
            "SELECT id, recorded_at, prompt, answer, metrics_json, steps_json \
             FROM traces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trace).transpose()
    }

    /// Delete everything but the newest `keep` traces. Returns the number
    /// of traces removed.
    pub async fn prune(&self, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM traces WHERE id NOT IN \
             (SELECT id FROM traces ORDER BY recorded_at DESC, id LIMIT ?)",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_trace(row: &sqlx::sqlite::SqliteRow) -> Result<Trace> {
    let metrics_json: String = row.get("metrics_json");
    let steps_json: String = row.get("steps_json");
    let recorded_ms: i64 = row.get("recorded_at");
    let recorded_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(recorded_ms)
        .single()
        .unwrap_or_else(Utc::now);

    Ok(Trace {
        id: row.get("id"),
        recorded_at,
        prompt: row.get("prompt"),
        answer: row.get("answer"),
        metrics: serde_json::from_str(&metrics_json)
            .context("Failed to parse trace metrics")?,
        steps: serde_json::from_str(&steps_json).context("Failed to parse trace steps")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use crate::models::{StepDetails, StepStatus};

    async fn temp_recorder() -> (tempfile::TempDir, TraceRecorder) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("rag.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, TraceRecorder::new(pool))
    }

    fn sample_steps() -> Vec<PipelineStep> {
        vec![PipelineStep {
            duration_ms: 2.0,
            status: StepStatus::Completed,
            details: StepDetails::Planning {
                sub_queries: vec!["q".to_string()],
                model: None,
                error: None,
            },
        }]
    }

    #[tokio::test]
    async fn test_record_and_get_round_trip() {
        let (_dir, recorder) = temp_recorder().await;
        let metrics = QueryMetrics {
            coverage: 0.4,
            tokens: 120,
            duration_ms: 8.0,
            chunk_count: 2,
        };
        let id = recorder
            .record("why is the sky blue", "scattering", &metrics, &sample_steps())
            .await
            .unwrap();

        let trace = recorder.get(&id).await.unwrap().unwrap();
        assert_eq!(trace.prompt, "why is the sky blue");
        assert_eq!(trace.answer, "scattering");
        assert_eq!(trace.metrics.tokens, 120);
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].details.name(), "planning");
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let (_dir, recorder) = temp_recorder().await;
        let metrics = QueryMetrics::default();
        for i in 0..3 {
            recorder
                .record(&format!("q{}", i), "a", &metrics, &[])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let traces = recorder.list(10).await.unwrap();
        assert_eq!(traces.len(), 3);
        assert_eq!(traces[0].prompt, "q2");
        assert_eq!(traces[2].prompt, "q0");
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let (_dir, recorder) = temp_recorder().await;
        let metrics = QueryMetrics::default();
        for i in 0..5 {
            recorder
                .record(&format!("q{}", i), "a", &metrics, &[])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let removed = recorder.prune(2).await.unwrap();
        assert_eq!(removed, 3);
        let traces = recorder.list(10).await.unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].prompt, "q4");
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_none() {
        let (_dir, recorder) = temp_recorder().await;
        assert!(recorder.get("missing").await.unwrap().is_none());
    }
}
