//! HTTP clients for the two external services.
//!
//! The net-execution substrate receives compiled plans; job services
//! receive work submissions and later report status through callbacks.
//! Job submission sits behind a trait so the coordinator can be exercised
//! in tests without a live service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::Plan;

/// Client for the net-execution substrate.
#[derive(Clone)]
pub struct NetClient {
    http: reqwest::Client,
    base_url: String,
}

impl NetClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.services.submit_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: config.services.net_url.trim_end_matches('/').to_string(),
        })
    }

    /// Submit a compiled plan; returns the substrate's key for the running
    /// net. Blocks until the substrate acknowledges.
    pub async fn submit_plan(&self, plan: &Plan) -> Result<String> {
        let url = format!("{}/nets", self.base_url);
        debug!(url = %url, transitions = plan.transitions.len(), "submitting plan");
        let response = self
            .http
            .post(&url)
            .json(plan)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("net submission rejected: {}", e)))?;
        let body: NetSubmissionResponse = response.json().await?;
        Ok(body.key)
    }
}

#[derive(Debug, Deserialize)]
struct NetSubmissionResponse {
    key: String,
}

/// Body POSTed to a job service to start work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Service tag naming the kind of work (job methods use "job")
    pub service: String,
    pub parameters: Value,
    pub inputs: Value,
    /// Callback URL the service reports status transitions to, with the
    /// execution id already baked into the query string
    pub status_callback_url: String,
}

/// Submission interface to job services.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Submit work; returns the job URL assigned by the service.
    async fn submit(&self, service_url: &str, submission: &JobSubmission) -> Result<String>;

    /// Ask the service to stop a running job. Best effort.
    async fn cancel(&self, job_url: &str) -> Result<()>;
}

/// reqwest-backed job client.
pub struct HttpJobClient {
    http: reqwest::Client,
}

impl HttpJobClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.services.submit_timeout_seconds))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl JobClient for HttpJobClient {
    async fn submit(&self, service_url: &str, submission: &JobSubmission) -> Result<String> {
        let url = format!("{}/jobs", service_url.trim_end_matches('/'));
        debug!(url = %url, service = %submission.service, "submitting job");
        let response = self
            .http
            .post(&url)
            .json(submission)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("job submission rejected: {}", e)))?;
        let body: JobSubmissionResponse = response.json().await?;
        Ok(body.url)
    }

    async fn cancel(&self, job_url: &str) -> Result<()> {
        debug!(url = %job_url, "canceling job");
        self.http
            .patch(job_url)
            .json(&serde_json::json!({"status": "canceled"}))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("job cancel rejected: {}", e)))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JobSubmissionResponse {
    url: String,
}

#[cfg(test)]
pub mod testing {
    //! Recording stub used by coordinator tests.

    use super::*;
    use std::sync::Mutex;

    /// Records submissions and hands back canned job URLs, or fails every
    /// call when `fail` is set.
    #[derive(Default)]
    pub struct RecordingJobClient {
        pub submissions: Mutex<Vec<(String, JobSubmission)>>,
        pub cancels: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingJobClient {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl JobClient for RecordingJobClient {
        async fn submit(&self, service_url: &str, submission: &JobSubmission) -> Result<String> {
            if self.fail {
                return Err(Error::Internal("job service unavailable".into()));
            }
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push((service_url.to_string(), submission.clone()));
            Ok(format!("http://jobs.test/v1/jobs/{}", submissions.len()))
        }

        async fn cancel(&self, job_url: &str) -> Result<()> {
            self.cancels.lock().unwrap().push(job_url.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_submission_serializes_callback_url() {
        let submission = JobSubmission {
            service: "job".into(),
            parameters: serde_json::json!({"cmd": "true"}),
            inputs: serde_json::json!({"n": 1}),
            status_callback_url:
                "http://petrel/v1/callbacks/methods/m1?callback_type=running&execution_id=e1"
                    .into(),
        };
        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["service"], "job");
        assert!(json["status_callback_url"]
            .as_str()
            .unwrap()
            .contains("execution_id=e1"));
    }
}
