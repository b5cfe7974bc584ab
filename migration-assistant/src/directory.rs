// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovering which instances an operator administers.
//!
//! The canonical source is the wikitech Semantic MediaWiki `ask` API, queried
//! first for the projects the operator is a member of and then for each
//! project's instances.

use crate::config::DirectoryConfig;
use crate::registry::RawInstanceRecord;
use async_trait::async_trait;
use serde_json::Value;
use slog::{debug, info, o, Logger};
use std::time::Duration;
use thiserror::Error;

/// Page-name prefix of projects in the `Member` listing.
const PROJECT_PAGE_PREFIX: &str = "Nova Resource:";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("unexpected response from {url}: {message}")]
    Response { url: String, message: String },
}

/// A source of instance records.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// List every instance in every project `identity` is a member of.
    ///
    /// Either the whole listing is returned or an error is; there is no
    /// partial fleet.
    async fn list_instances(
        &self,
        identity: &str,
    ) -> Result<Vec<RawInstanceRecord>, DirectoryError>;
}

/// The wikitech instance directory.
pub struct WikitechDirectory {
    log: Logger,
    url: String,
    client: reqwest::Client,
}

impl WikitechDirectory {
    pub fn new(
        log: &Logger,
        config: &DirectoryConfig,
    ) -> Result<Self, DirectoryError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.timeout.min(Duration::from_secs(15)))
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(DirectoryError::Client)?;
        Ok(WikitechDirectory {
            log: log.new(o!("component" => "WikitechDirectory")),
            url: config.url.clone(),
            client,
        })
    }

    async fn ask(&self, query: &str) -> Result<Value, DirectoryError> {
        debug!(self.log, "querying directory"; "query" => query);
        let request_error =
            |err| DirectoryError::Request { url: self.url.clone(), err };
        self.client
            .get(&self.url)
            .query(&[("action", "ask"), ("query", query), ("format", "json")])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(request_error)?
            .json()
            .await
            .map_err(request_error)
    }
}

#[async_trait]
impl InstanceDirectory for WikitechDirectory {
    async fn list_instances(
        &self,
        identity: &str,
    ) -> Result<Vec<RawInstanceRecord>, DirectoryError> {
        let listing = self
            .ask(&format!("[[Member::User:{}]]", identity))
            .await?;
        let projects = parse_projects(&listing)
            .map_err(|message| self.bad_response(message))?;
        info!(
            self.log,
            "found projects";
            "identity" => identity,
            "count" => projects.len(),
        );

        let listings = futures::future::try_join_all(
            projects.iter().map(|project| self.list_project(project)),
        )
        .await?;
        let records = listings.into_iter().flatten().collect();
        Ok(records)
    }
}

impl WikitechDirectory {
    async fn list_project(
        &self,
        project: &str,
    ) -> Result<Vec<RawInstanceRecord>, DirectoryError> {
        let listing = self
            .ask(&format!(
                "[[Resource Type::instance]][[Project::{}]]\
                 |?Instance Name|?Project",
                project
            ))
            .await?;
        let found = parse_instance_listing(&listing, project)
            .map_err(|message| self.bad_response(message))?;
        debug!(
            self.log,
            "listed project instances";
            "project" => project,
            "count" => found.len(),
        );
        Ok(found)
    }

    fn bad_response(&self, message: String) -> DirectoryError {
        DirectoryError::Response { url: self.url.clone(), message }
    }
}

/// A fixed list of instances, used by `--debug` and in tests.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    records: Vec<RawInstanceRecord>,
}

impl StaticDirectory {
    pub fn new(records: Vec<RawInstanceRecord>) -> Self {
        StaticDirectory { records }
    }

    /// The single instance used when debugging the tool itself.
    pub fn debug_fleet() -> Self {
        StaticDirectory::new(vec![RawInstanceRecord::new(
            "limn0",
            "analytics",
            "pmtpa",
        )])
    }
}

#[async_trait]
impl InstanceDirectory for StaticDirectory {
    async fn list_instances(
        &self,
        _identity: &str,
    ) -> Result<Vec<RawInstanceRecord>, DirectoryError> {
        Ok(self.records.clone())
    }
}

/// `query.results` of an `ask` response.
///
/// SMW encodes an empty result set as `[]` rather than `{}`.
fn results(
    response: &Value,
) -> Result<Option<&serde_json::Map<String, Value>>, String> {
    let results = response
        .get("query")
        .and_then(|query| query.get("results"))
        .ok_or_else(|| "response has no query.results".to_string())?;
    match results {
        Value::Object(map) => Ok(Some(map)),
        Value::Array(list) if list.is_empty() => Ok(None),
        other => Err(format!("query.results is not an object: {}", other)),
    }
}

/// Strip a page-name prefix and normalize a project name.
fn project_from_page(page: &str) -> String {
    page.split_once(':')
        .map(|(_, project)| project)
        .unwrap_or(page)
        .trim()
        .to_lowercase()
}

/// Parse the projects out of a `[[Member::User:...]]` response.
pub fn parse_projects(response: &Value) -> Result<Vec<String>, String> {
    let Some(results) = results(response)? else {
        return Ok(Vec::new());
    };
    Ok(results
        .keys()
        .filter(|page| page.starts_with(PROJECT_PAGE_PREFIX))
        .map(|page| project_from_page(page))
        .collect())
}

/// Parse the instances out of a project's instance listing.
///
/// Resource names look like `i-000001c5.pmtpa.wmflabs`; the datacenter is
/// the second component.  `queried_project` is used when the result carries
/// no `Project` printout.
pub fn parse_instance_listing(
    response: &Value,
    queried_project: &str,
) -> Result<Vec<RawInstanceRecord>, String> {
    let Some(results) = results(response)? else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    for (resource, entry) in results {
        let datacenter = resource.split('.').nth(1).ok_or_else(|| {
            format!("resource name {:?} has no datacenter", resource)
        })?;
        let printouts = entry.get("printouts");
        let project = printouts
            .and_then(|p| p.get("Project"))
            .and_then(|p| p.as_array())
            .and_then(|list| list.first())
            .and_then(|page| match page {
                Value::String(s) => Some(s.as_str()),
                other => other.get("fulltext").and_then(Value::as_str),
            })
            .map(project_from_page)
            .unwrap_or_else(|| queried_project.to_string());
        let names = printouts
            .and_then(|p| p.get("Instance Name"))
            .and_then(|n| n.as_array())
            .ok_or_else(|| {
                format!("resource {:?} has no instance name", resource)
            })?;
        for name in names {
            let name = name.as_str().ok_or_else(|| {
                format!("resource {:?} has a non-string instance name", resource)
            })?;
            records.push(RawInstanceRecord::new(name, &project, datacenter));
        }
    }
    Ok(records)
}
