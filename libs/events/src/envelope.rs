use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gpufleet_id::EventId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Model,
    Instance,
    Worker,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Model => "model",
            AggregateType::Instance => "instance",
            AggregateType::Worker => "worker",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(AggregateType::Model),
            "instance" => Ok(AggregateType::Instance),
            "worker" => Ok(AggregateType::Worker),
            other => Err(EventError::InvalidPayload(format!(
                "unknown aggregate type '{other}'"
            ))),
        }
    }
}

/// A typed event body.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;
    const AGGREGATE: AggregateType;

    fn aggregate_id(&self) -> String;
}

/// An event that has not been appended to the log yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn from_payload<P: EventPayload>(payload: &P) -> Result<Self, EventError> {
        Ok(Self {
            aggregate_type: P::AGGREGATE,
            aggregate_id: payload.aggregate_id(),
            event_type: P::EVENT_TYPE.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Stamps the event with its log position.
    pub fn into_envelope(self, event_id: EventId, occurred_at: DateTime<Utc>) -> EventEnvelope {
        EventEnvelope {
            event_id,
            occurred_at,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
        }
    }
}

/// An event as stored in and served from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn is<P: EventPayload>(&self) -> bool {
        self.event_type == P::EVENT_TYPE
    }

    /// Decodes the payload, checking the event type first.
    pub fn decode<P: EventPayload>(&self) -> Result<P, EventError> {
        if !self.is::<P>() {
            return Err(EventError::WrongType {
                expected: P::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// One page of the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<EventEnvelope>,
    /// Id of the last event in `events`, or the requested cursor when empty.
    pub next_cursor: EventId,
}
