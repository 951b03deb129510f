// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Renders job scripts and termination hooks through a fixed variable set:
//! `cluster`, `job`, `baseUrl` (`base_url` for the on-terminate hook, to
//! match the historical naming split between the submit and terminate
//! paths) and an explicit `params` submap. Nothing is ever flattened
//! directly into template scope: callers build the map once with
//! [`TemplateContext::new`] and extend it with [`TemplateContext::with_param`].

use std::collections::BTreeMap;

use handlebars::Handlebars;
use model::{Cluster, Job};
use serde::Serialize;
use serde_json::Value;

use crate::error::ControllerError;

#[derive(Serialize)]
pub struct TemplateContext<'a> {
    cluster: &'a Cluster,
    job: &'a Job,
    #[serde(rename = "baseUrl")]
    base_url: &'a str,
    #[serde(rename = "base_url")]
    base_url_snake: &'a str,
    params: BTreeMap<String, Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(cluster: &'a Cluster, job: &'a Job, base_url: &'a str) -> Self {
        TemplateContext {
            cluster,
            job,
            base_url,
            base_url_snake: base_url,
            params: job.params.clone(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

pub fn render(template: &str, context: &TemplateContext) -> Result<String, ControllerError> {
    let mut handlebars = Handlebars::new();
    // These are shell scripts, not HTML: a `baseUrl` query string containing
    // `&` must come through unescaped rather than as `&amp;`.
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(template, context)
        .map_err(|e| ControllerError::Unexpected(format!("template rendering failed: {e}")))
}

/// Joins a job's commands into the single script body staged on the head
/// node, rendering each line through the shared context so commands may
/// reference `{{job.id}}`, `{{params.foo}}`, etc.
pub fn render_script(commands: &[String], context: &TemplateContext) -> Result<String, ControllerError> {
    let joined = commands.join("\n");
    render(&joined, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{ClusterConfig, ClusterType, JobStatus, QueueConfig};

    fn fixture_cluster() -> Cluster {
        Cluster {
            id: "cluster-1".to_string(),
            cluster_type: ClusterType::Ec2,
            config: ClusterConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    fn fixture_job() -> Job {
        Job {
            id: "job-1".to_string(),
            name: "render-test".to_string(),
            commands: vec![],
            input: vec![],
            output: vec![],
            params: BTreeMap::new(),
            on_complete: None,
            on_terminate: None,
            status: JobStatus::Created,
            queue_job_id: None,
            queued_time: None,
            running_time: None,
        }
    }

    #[test]
    fn renders_job_and_param_variables() {
        let cluster = fixture_cluster();
        let job = fixture_job();
        let ctx = TemplateContext::new(&cluster, &job, "https://metadata.example")
            .with_param("slots", 4);
        let rendered = render(
            "run --job {{job.id}} --slots {{params.slots}} --url {{baseUrl}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(
            rendered,
            "run --job job-1 --slots 4 --url https://metadata.example"
        );
    }

    #[test]
    fn special_characters_in_variables_are_not_html_escaped() {
        let cluster = fixture_cluster();
        let job = fixture_job();
        let ctx = TemplateContext::new(
            &cluster,
            &job,
            "https://metadata.example?a=1&b=2",
        );
        let rendered = render("curl '{{baseUrl}}'", &ctx).unwrap();
        assert_eq!(rendered, "curl 'https://metadata.example?a=1&b=2'");
    }

    #[test]
    fn joins_multiple_commands_with_newlines() {
        let cluster = fixture_cluster();
        let job = fixture_job();
        let ctx = TemplateContext::new(&cluster, &job, "https://metadata.example");
        let rendered = render_script(
            &["echo one".to_string(), "echo two {{job.name}}".to_string()],
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered, "echo one\necho two render-test");
    }
}
