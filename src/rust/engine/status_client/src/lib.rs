// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Thin client for the metadata service: fetch a job's current status, and
//! PATCH updates to it. Every update is a partial document — callers only
//! set the fields that changed.

use model::{JobStatus, Timings};
use serde_json::{json, Value};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum StatusClientError {
    #[error("transport error talking to the metadata service: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("metadata service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed metadata service response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StatusClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StatusClientError::Transport(_))
    }
}

#[derive(Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

/// Partial PATCH body for a job. Only fields actually set are serialized.
#[derive(Default)]
pub struct JobUpdate {
    fields: serde_json::Map<String, Value>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.fields.insert(
            "status".to_string(),
            serde_json::to_value(status).expect("JobStatus always serializes"),
        );
        self
    }

    pub fn queue_job_id(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), json!(value));
        self
    }

    pub fn queued_time(mut self, when: chrono::DateTime<chrono::Utc>) -> Self {
        self.fields.insert("queuedTime".to_string(), json!(when));
        self
    }

    pub fn running_time(mut self, when: chrono::DateTime<chrono::Utc>) -> Self {
        self.fields.insert("runningTime".to_string(), json!(when));
        self
    }

    pub fn timings(mut self, timings: &Timings) -> Self {
        self.fields.insert(
            "timings".to_string(),
            serde_json::to_value(timings).expect("Timings always serializes"),
        );
        self
    }

    pub fn output(mut self, output: &[model::OutputSpec]) -> Self {
        self.fields.insert(
            "output".to_string(),
            serde_json::to_value(output).expect("OutputSpec always serializes"),
        );
        self
    }

    fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl StatusClient {
    pub fn new(base_url: Url, token: String) -> Self {
        StatusClient {
            http: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn job_url(&self, job_id: &str) -> Url {
        self.base_url
            .join(&format!("jobs/{job_id}/status"))
            .expect("job id does not contain URL-unsafe characters")
    }

    fn patch_url(&self, job_id: &str) -> Url {
        self.base_url
            .join(&format!("jobs/{job_id}"))
            .expect("job id does not contain URL-unsafe characters")
    }

    /// Fetches only the job's current `status`. This is the one piece of
    /// server-owned state that can change underneath a task's own
    /// long-held job snapshot (an operator terminating a job out of band,
    /// for instance); every other field a task needs comes from the
    /// snapshot it was handed, not from this endpoint.
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatus, StatusClientError> {
        #[derive(serde::Deserialize)]
        struct StatusOnly {
            status: JobStatus,
        }

        let response = self
            .http
            .get(self.job_url(job_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatusClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let decoded = response.json::<StatusOnly>().await?;
        Ok(decoded.status)
    }

    pub async fn patch_job(&self, job_id: &str, update: JobUpdate) -> Result<(), StatusClientError> {
        let body = update.into_value();
        log::debug!("PATCH job {job_id}: {body}");
        let response = self
            .http
            .patch(self.patch_url(job_id))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatusClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_update_only_serializes_fields_that_were_set() {
        let update = JobUpdate::new().status(JobStatus::Queued);
        let value = update.into_value();
        assert_eq!(value, json!({"status": "queued"}));
    }

    #[test]
    fn job_update_accumulates_multiple_fields() {
        let timings = Timings {
            queued_ms: Some(1500),
            running_ms: None,
        };
        let update = JobUpdate::new()
            .status(JobStatus::Queued)
            .queue_job_id("sgeId", "42")
            .timings(&timings);
        let value = update.into_value();
        assert_eq!(
            value,
            json!({"status": "queued", "sgeId": "42", "timings": {"queued": 1500}})
        );
    }

    #[test]
    fn empty_update_serializes_to_empty_object() {
        assert_eq!(JobUpdate::new().into_value(), json!({}));
    }

    #[test]
    fn only_transport_errors_are_transient() {
        let http_err = StatusClientError::Http {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(!http_err.is_transient());
    }

    #[test]
    fn job_url_and_patch_url_are_distinct_endpoints() {
        let client = StatusClient::new(
            Url::parse("https://metadata.example/api/").unwrap(),
            "tok".to_string(),
        );
        assert_eq!(
            client.job_url("A").as_str(),
            "https://metadata.example/api/jobs/A/status"
        );
        assert_eq!(
            client.patch_url("A").as_str(),
            "https://metadata.example/api/jobs/A"
        );
    }
}
