//! Effects: side-channel notifications derived from state transitions.
//!
//! Every instance that has effects runs one pipeline task. It takes the
//! store's transitions one at a time, in application order; within a
//! transition all effects are evaluated concurrently. An effect fires when
//! its activator accepts the transition (or it has none) and publishes one
//! [`EffectMessage`] on `<full_instance_id>:effects`.

use std::sync::Arc;

use futures::future::join_all;
use rfx_core::Frame;
use rfx_events::Subscription;
use rfx_store::{Channel, Transition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Decides whether an effect fires for `(new, old, frame)`.
pub type ActivatorFn = dyn Fn(&Value, &Value, &Frame) -> bool + Send + Sync;

/// Builds the message for `(new, old, frame)`.
pub type GeneratorFn = dyn Fn(&Value, &Value, &Frame) -> anyhow::Result<EffectMessage> + Send + Sync;

/// What an effect publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectMessage {
    pub key: String,
    #[serde(default)]
    pub payload: Value,
}

impl EffectMessage {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

#[derive(Clone)]
pub struct Effect {
    key: String,
    activator: Option<Arc<ActivatorFn>>,
    generator: Option<Arc<GeneratorFn>>,
}

impl core::fmt::Debug for Effect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Effect")
            .field("key", &self.key)
            .field("activator", &self.activator.is_some())
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

impl Effect {
    /// An effect that fires on every transition with `{key, payload: null}`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            activator: None,
            generator: None,
        }
    }

    pub fn when<F>(mut self, activator: F) -> Self
    where
        F: Fn(&Value, &Value, &Frame) -> bool + Send + Sync + 'static,
    {
        self.activator = Some(Arc::new(activator));
        self
    }

    pub fn generate<F>(mut self, generator: F) -> Self
    where
        F: Fn(&Value, &Value, &Frame) -> anyhow::Result<EffectMessage> + Send + Sync + 'static,
    {
        self.generator = Some(Arc::new(generator));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fires(&self, transition: &Transition) -> bool {
        self.activator.as_ref().is_none_or(|activator| {
            activator(&transition.new, &transition.old, &transition.frame)
        })
    }

    pub fn message(&self, transition: &Transition) -> anyhow::Result<EffectMessage> {
        match &self.generator {
            Some(generator) => generator(&transition.new, &transition.old, &transition.frame),
            None => Ok(EffectMessage::new(self.key.clone(), Value::Null)),
        }
    }
}

/// Handle on a running pipeline; the task stops when this is dropped.
#[derive(Debug)]
pub(crate) struct EffectsPipeline {
    task: JoinHandle<()>,
}

impl EffectsPipeline {
    pub(crate) fn spawn(
        effects: Arc<[Effect]>,
        transitions: Subscription<Transition>,
        channel: Channel,
    ) -> Self {
        Self {
            task: tokio::spawn(run(effects, transitions, channel)),
        }
    }
}

impl Drop for EffectsPipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(effects: Arc<[Effect]>, mut transitions: Subscription<Transition>, channel: Channel) {
    while let Some(transition) = transitions.recv().await {
        join_all(
            effects
                .iter()
                .map(|effect| fire(effect, &transition, &channel)),
        )
        .await;
    }

    debug!(channel = %channel.name(), "effects pipeline stopped");
}

async fn fire(effect: &Effect, transition: &Transition, channel: &Channel) {
    if !effect.fires(transition) {
        return;
    }

    let message = match effect.message(transition) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                effect = %effect.key,
                height = transition.height,
                error = %e,
                "effect generator failed"
            );
            return;
        }
    };

    if let Err(e) = channel.publish(&message.key, &message.payload).await {
        warn!(
            effect = %effect.key,
            height = transition.height,
            error = %e,
            "failed to publish effect"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transition(old: Value, new: Value) -> Transition {
        Transition {
            height: 1,
            old: Arc::new(old),
            new: Arc::new(new),
            frame: Arc::new(Frame::new(1, Vec::new())),
        }
    }

    #[test]
    fn effects_without_activator_always_fire() {
        let effect = Effect::new("touched");
        let t = transition(json!({}), json!({"a": 1}));

        assert!(effect.fires(&t));
        assert_eq!(
            effect.message(&t).unwrap(),
            EffectMessage::new("touched", Value::Null)
        );
    }

    #[test]
    fn activator_sees_new_then_old() {
        let effect = Effect::new("activated").when(|new, old, _| {
            old["status"] == "pending" && new["status"] == "active"
        });

        assert!(effect.fires(&transition(
            json!({"status": "pending"}),
            json!({"status": "active"})
        )));
        assert!(!effect.fires(&transition(
            json!({"status": "active"}),
            json!({"status": "pending"})
        )));
    }

    #[test]
    fn generator_output_is_the_message() {
        let effect = Effect::new("status").generate(|new, _, frame| {
            Ok(EffectMessage::new(
                "status:changed",
                json!({"status": new["status"], "height": frame.height}),
            ))
        });

        let message = effect
            .message(&transition(json!({}), json!({"status": "active"})))
            .unwrap();
        assert_eq!(message.key, "status:changed");
        assert_eq!(message.payload, json!({"status": "active", "height": 1}));
    }
}
