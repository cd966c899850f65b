//! Topic and subscription provisioning.
//!
//! Runs once during startup, before any traffic flows. The policy is
//! read-then-create: probe for the resource, create it on `NotFound`, and
//! tolerate an `AlreadyExists` answer to the create (another provisioner won
//! the race). Any other failure is fatal to startup. Provisioning is skipped
//! entirely when the corresponding auto-create flag is off - the operator is
//! expected to have provisioned the infrastructure out of band.

use std::fmt;

use tracing::info;

use crate::transport::{
    PublisherClient, SubscriberClient, SubscriptionSpec, TopicName, TransportError,
};

/// Fatal provisioning failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    Topic {
        topic: String,
        source: TransportError,
    },
    Subscription {
        subscription: String,
        source: TransportError,
    },
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::Topic { topic, source } => {
                write!(f, "failed to provision topic {}: {}", topic, source)
            }
            ProvisionError::Subscription {
                subscription,
                source,
            } => write!(
                f,
                "failed to provision subscription {}: {}",
                subscription, source
            ),
        }
    }
}

impl std::error::Error for ProvisionError {}

/// Ensures topics and subscriptions exist before the bus starts consuming.
pub struct Provisioner;

impl Provisioner {
    pub fn ensure_topic(
        client: &dyn PublisherClient,
        topic: &TopicName,
        auto_create: bool,
    ) -> Result<(), ProvisionError> {
        if !auto_create {
            return Ok(());
        }

        match client.get_topic(topic) {
            Ok(()) => Ok(()),
            Err(TransportError::NotFound(_)) => match client.create_topic(topic) {
                Ok(()) => {
                    info!(topic = %topic, "created topic");
                    Ok(())
                }
                // Lost a race against a concurrent provisioner.
                Err(TransportError::AlreadyExists(_)) => Ok(()),
                Err(source) => Err(ProvisionError::Topic {
                    topic: topic.to_string(),
                    source,
                }),
            },
            Err(source) => Err(ProvisionError::Topic {
                topic: topic.to_string(),
                source,
            }),
        }
    }

    pub fn ensure_subscription(
        client: &dyn SubscriberClient,
        spec: &SubscriptionSpec,
        auto_create: bool,
    ) -> Result<(), ProvisionError> {
        if !auto_create {
            return Ok(());
        }

        match client.get_subscription(&spec.name) {
            Ok(()) => Ok(()),
            Err(TransportError::NotFound(_)) => match client.create_subscription(spec) {
                Ok(()) => {
                    info!(subscription = %spec.name, topic = %spec.topic, "created subscription");
                    Ok(())
                }
                Err(TransportError::AlreadyExists(_)) => Ok(()),
                Err(source) => Err(ProvisionError::Subscription {
                    subscription: spec.name.to_string(),
                    source,
                }),
            },
            Err(source) => Err(ProvisionError::Subscription {
                subscription: spec.name.to_string(),
                source,
            }),
        }
    }
}
