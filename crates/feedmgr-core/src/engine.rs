//! Flow engine interface.
//!
//! The flow engine turns a template plus properties into a running process
//! graph. Materialization is described up front by an immutable
//! [`MaterializeRequest`] and executed in one call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedMgrError, Result};
use crate::types::{FeedId, GraphRef, PortConnection, Property, Schedule, Template};

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReusableLinkage {
    None,
    /// The feed itself is a reusable flow other feeds connect into.
    Reusable,
    /// The feed's output ports connect into a reusable flow.
    Connections { ports: Vec<PortConnection> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<FeedId>,
    pub category: String,
    pub feed_name: String,
    pub flow_template_id: String,
    pub properties: Vec<Property>,
    pub linkage: ReusableLinkage,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_processor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Graph currently backing the feed, when updating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_graph: Option<GraphRef>,
    /// Ask the engine to report the previous versioned graph for removal.
    pub remove_inactive_versioned_graphs: bool,
}

/// Inputs for [`assemble_request`].
pub struct RequestParts<'a> {
    pub feed_id: Option<&'a FeedId>,
    pub category: &'a str,
    pub feed_name: &'a str,
    pub template: &'a Template,
    pub properties: Vec<Property>,
    pub enabled: bool,
    pub input_processor_type: Option<&'a str>,
    pub schedule: Option<&'a Schedule>,
    pub existing_graph: Option<&'a GraphRef>,
    pub remove_inactive_versioned_graphs: bool,
}

/// Build the materialization request for a feed.
///
/// A reusable template carries no schedule or input processor; a template
/// that feeds into a reusable one carries its port connections.
pub fn assemble_request(parts: RequestParts<'_>) -> MaterializeRequest {
    let template = parts.template;
    let (linkage, input_processor_type, schedule) = if template.reusable {
        (ReusableLinkage::Reusable, None, None)
    } else {
        let linkage = if template.uses_reusable_template() {
            ReusableLinkage::Connections {
                ports: template.connections.clone(),
            }
        } else {
            ReusableLinkage::None
        };
        (
            linkage,
            parts.input_processor_type.map(str::to_string),
            parts.schedule.cloned(),
        )
    };
    MaterializeRequest {
        feed_id: parts.feed_id.cloned(),
        category: parts.category.to_string(),
        feed_name: parts.feed_name.to_string(),
        flow_template_id: template.flow_template_id.clone(),
        properties: parts.properties,
        linkage,
        enabled: parts.enabled,
        input_processor_type,
        schedule,
        existing_graph: parts.existing_graph.cloned(),
        remove_inactive_versioned_graphs: parts.remove_inactive_versioned_graphs,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterializeOutcome {
    #[serde(default)]
    pub graph: Option<GraphRef>,
    pub success: bool,
    /// The engine already undid its own partial work.
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Previous versioned graph that is no longer needed.
    #[serde(default)]
    pub superseded: Option<GraphRef>,
}

pub trait FlowEngine {
    /// `Err` means the engine could not be reached; a reachable engine that
    /// refuses reports `success: false`.
    fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializeOutcome>;
    fn rollback(&self, graph: &GraphRef) -> Result<()>;
    fn enable(&self, graph: &GraphRef) -> Result<()>;
    fn disable(&self, graph: &GraphRef) -> Result<()>;
    fn delete(&self, graph: &GraphRef) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HttpFlowEngine
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StateChange {
    state: &'static str,
}

/// [`FlowEngine`] over the engine's JSON HTTP API.
pub struct HttpFlowEngine {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpFlowEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedMgrError::Engine(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn expect_success(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(FeedMgrError::Engine(format!("{status}: {}", body.trim())))
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> Result<reqwest::blocking::Response> {
        let resp = req.send().map_err(|e| FeedMgrError::Engine(e.to_string()))?;
        Self::expect_success(resp)
    }
}

impl FlowEngine for HttpFlowEngine {
    fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializeOutcome> {
        let resp = self.send(self.client.post(self.url("/graphs")).json(request))?;
        resp.json::<MaterializeOutcome>()
            .map_err(|e| FeedMgrError::Engine(e.to_string()))
    }

    fn rollback(&self, graph: &GraphRef) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("/graphs/{graph}/rollback"))),
        )
        .map(|_| ())
        .map_err(|e| FeedMgrError::Rollback(e.to_string()))
    }

    fn enable(&self, graph: &GraphRef) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&format!("/graphs/{graph}/state")))
                .json(&StateChange { state: "running" }),
        )
        .map(|_| ())
    }

    fn disable(&self, graph: &GraphRef) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&format!("/graphs/{graph}/state")))
                .json(&StateChange { state: "stopped" }),
        )
        .map(|_| ())
    }

    fn delete(&self, graph: &GraphRef) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/graphs/{graph}"))))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(reusable: bool, connections: Vec<PortConnection>) -> Template {
        Template {
            id: "t1".into(),
            name: "ingest".into(),
            flow_template_id: "flow-1".into(),
            properties: vec![],
            reusable,
            connections,
        }
    }

    fn parts(template: &Template) -> RequestParts<'_> {
        RequestParts {
            feed_id: None,
            category: "sales",
            feed_name: "orders",
            template,
            properties: vec![],
            enabled: false,
            input_processor_type: Some("GetFile"),
            schedule: None,
            existing_graph: None,
            remove_inactive_versioned_graphs: true,
        }
    }

    #[test]
    fn reusable_template_drops_input_processor() {
        let t = template(true, vec![]);
        let req = assemble_request(parts(&t));
        assert_eq!(req.linkage, ReusableLinkage::Reusable);
        assert!(req.input_processor_type.is_none());
    }

    #[test]
    fn connections_become_port_linkage() {
        let port = PortConnection {
            reusable_input_port: "in".into(),
            feed_output_port: "out".into(),
        };
        let t = template(false, vec![port.clone()]);
        let req = assemble_request(parts(&t));
        assert_eq!(req.linkage, ReusableLinkage::Connections { ports: vec![port] });
        assert_eq!(req.input_processor_type.as_deref(), Some("GetFile"));
        assert_eq!(req.flow_template_id, "flow-1");
    }

    #[test]
    fn http_materialize_parses_outcome() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/graphs")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"graph":"g-1","success":true,"superseded":"g-0"}"#)
            .create();

        let engine = HttpFlowEngine::new(&server.url(), Duration::from_secs(5)).unwrap();
        let t = template(false, vec![]);
        let outcome = engine.materialize(&assemble_request(parts(&t))).unwrap();

        mock.assert();
        assert!(outcome.success);
        assert!(!outcome.rolled_back);
        assert_eq!(outcome.graph, Some(GraphRef::new("g-1")));
        assert_eq!(outcome.superseded, Some(GraphRef::new("g-0")));
    }

    #[test]
    fn http_error_status_maps_to_engine_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("PUT", "/graphs/g-1/state")
            .with_status(500)
            .with_body("boom")
            .create();

        let engine = HttpFlowEngine::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = engine.enable(&GraphRef::new("g-1")).unwrap_err();
        assert!(matches!(err, FeedMgrError::Engine(ref m) if m.contains("boom")));
    }

    #[test]
    fn http_rollback_failure_maps_to_rollback_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/graphs/g-1/rollback")
            .with_status(409)
            .create();

        let engine = HttpFlowEngine::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = engine.rollback(&GraphRef::new("g-1")).unwrap_err();
        assert!(matches!(err, FeedMgrError::Rollback(_)));
    }
}
