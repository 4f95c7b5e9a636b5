//! The channel allow-list.
//!
//! Built once at startup, then moved into an `Arc` and handed to the
//! controller and to every Bridge. Nothing mutates it after that point;
//! `register` takes `&mut self`, so ownership enforces the freeze.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::shape::Shape;
use crate::error::{Result, TetherError};

/// How messages flow on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Request/response: UI `invoke` → controller handler → result.
    Invoke,
    /// Fire-and-forget: UI `send` → controller listener, no response path.
    Send,
    /// Broadcast: controller → subscribed UI listeners.
    Event,
}

/// Immutable description of one channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub direction: Direction,
    /// Ordered named parameters. Positional arguments bind to these in order.
    /// Unused for `Event` channels.
    pub params: Vec<(String, Shape)>,
    /// Result shape for `Invoke`, payload shape for `Event`, ignored for `Send`.
    pub result: Shape,
}

impl ChannelSpec {
    pub fn invoke(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Invoke)
    }

    pub fn send(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Send)
    }

    /// An event channel whose payload must match `payload`.
    pub fn event(name: impl Into<String>, payload: Shape) -> Self {
        Self {
            result: payload,
            ..Self::new(name, Direction::Event)
        }
    }

    fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            params: Vec::new(),
            result: Shape::Any,
        }
    }

    /// Append a named positional parameter.
    pub fn param(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.params.push((name.into(), shape));
        self
    }

    pub fn returns(mut self, shape: Shape) -> Self {
        self.result = shape;
        self
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelSpec>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel.
    ///
    /// # Errors
    /// - `DuplicateChannel` if the name is already present (any direction).
    /// - `InvalidChannelName` for empty names or names containing whitespace.
    pub fn register(&mut self, spec: ChannelSpec) -> Result<()> {
        if spec.name.is_empty() || spec.name.chars().any(char::is_whitespace) {
            return Err(TetherError::InvalidChannelName(spec.name));
        }
        if self.channels.contains_key(&spec.name) {
            return Err(TetherError::DuplicateChannel { channel: spec.name });
        }
        self.channels.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Builder-style `register` for startup tables.
    pub fn with(mut self, spec: ChannelSpec) -> Result<Self> {
        self.register(spec)?;
        Ok(self)
    }

    /// Look up a channel registered for `direction`.
    ///
    /// A channel registered for another direction is reported as unknown: a
    /// name is only on the allow-list for the direction it was declared with.
    pub fn lookup(&self, name: &str, direction: Direction) -> Result<&ChannelSpec> {
        self.channels
            .get(name)
            .filter(|spec| spec.direction == direction)
            .ok_or_else(|| TetherError::UnknownChannel {
                channel: name.to_string(),
            })
    }

    /// Validate an already-bound payload.
    ///
    /// For `Invoke`/`Send` the payload is the bound argument object; for
    /// `Event` it is the event payload.
    pub fn validate(&self, name: &str, direction: Direction, payload: &Value) -> Result<()> {
        let spec = self.lookup(name, direction)?;
        let outcome = match direction {
            Direction::Event => spec.result.check(payload),
            Direction::Invoke | Direction::Send => Shape::check_fields(&spec.params, payload),
        };
        outcome.map_err(|detail| TetherError::ShapeMismatch {
            channel: name.to_string(),
            detail,
        })
    }

    /// Bind positional `args` to the channel's named parameters and validate.
    ///
    /// Missing trailing arguments bind to `null`; surplus arguments are a
    /// shape mismatch.
    pub fn bind_args(&self, name: &str, direction: Direction, args: Vec<Value>) -> Result<Value> {
        let spec = self.lookup(name, direction)?;
        if args.len() > spec.params.len() {
            return Err(TetherError::ShapeMismatch {
                channel: name.to_string(),
                detail: format!(
                    "expected at most {} argument(s), got {}",
                    spec.params.len(),
                    args.len()
                ),
            });
        }

        let mut bound = Map::with_capacity(spec.params.len());
        let mut args = args.into_iter();
        for (param, _) in &spec.params {
            bound.insert(param.clone(), args.next().unwrap_or(Value::Null));
        }
        let bound = Value::Object(bound);

        self.validate(name, direction, &bound)?;
        Ok(bound)
    }

    /// Check a handler's result against the declared result shape.
    pub fn validate_result(&self, name: &str, result: &Value) -> Result<()> {
        let spec = self.lookup(name, Direction::Invoke)?;
        spec.result
            .check(result)
            .map_err(|detail| TetherError::ShapeMismatch {
                channel: name.to_string(),
                detail: format!("result {detail}"),
            })
    }

    pub fn get(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.get(name)
    }

    pub fn contains(&self, name: &str, direction: Direction) -> bool {
        self.lookup(name, direction).is_ok()
    }

    /// Registered channel names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
