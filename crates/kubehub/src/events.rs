use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use serde::Serialize;
use tracing::debug;
use trellis_core::StoreError;

use crate::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub object: ObjectKey,
    pub uid: Option<String>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, ev: EventRecord) -> Result<(), StoreError>;
}

/// Writes core/v1 Events next to the object they describe.
pub struct KubeEvents {
    client: Client,
    reporter: String,
}

impl KubeEvents {
    pub fn new(client: Client, reporter: impl Into<String>) -> Self {
        Self { client, reporter: reporter.into() }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, ev: EventRecord) -> Result<(), StoreError> {
        let ns = ev.object.namespace.clone().unwrap_or_else(|| "default".to_string());
        let now = Time(chrono::Utc::now());
        let body = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", ev.object.name)),
                namespace: Some(ns.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(ev.object.ty.api_version.clone()),
                kind: Some(ev.object.ty.kind.clone()),
                name: Some(ev.object.name.clone()),
                namespace: ev.object.namespace.clone(),
                uid: ev.uid.clone(),
                ..Default::default()
            },
            reason: Some(ev.reason.clone()),
            message: Some(ev.message.clone()),
            type_: Some(ev.kind.as_str().to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            source: Some(EventSource { component: Some(self.reporter.clone()), host: None }),
            reporting_component: Some(self.reporter.clone()),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), &body).await.map_err(|e| StoreError::Api(e.to_string()))?;
        debug!(object = %ev.object, reason = %ev.reason, "event published");
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemEvents {
    events: Mutex<Vec<EventRecord>>,
}

impl MemEvents {
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for MemEvents {
    async fn publish(&self, ev: EventRecord) -> Result<(), StoreError> {
        self.events.lock().map_err(|_| StoreError::Api("event log poisoned".into()))?.push(ev);
        Ok(())
    }
}
