//! Public address resolution for placed pods.

use std::sync::Arc;

use async_trait::async_trait;
use gamefleet_api::NodeAddressType;
use thiserror::Error;
use tracing::info;

use crate::store::{NodeApi, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("node {node} has neither an external nor an internal address")]
    NoAddress { node: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AddressError {
    /// A node may gain an address, or come back, later.
    pub fn is_retryable(&self) -> bool {
        match self {
            AddressError::NoAddress { .. } => true,
            AddressError::Store(err) => err.is_retryable() || err.is_not_found(),
        }
    }
}

/// Resolves the address players use to reach a node.
#[async_trait]
pub trait NodeAddressResolver: Send + Sync {
    async fn public_address(&self, node_name: &str) -> Result<String, AddressError>;
}

/// Reads node addresses from the store: the first external address, else
/// the first internal one.
pub struct StoreAddressResolver {
    nodes: Arc<dyn NodeApi>,
}

impl StoreAddressResolver {
    pub fn new(nodes: Arc<dyn NodeApi>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeAddressResolver for StoreAddressResolver {
    async fn public_address(&self, node_name: &str) -> Result<String, AddressError> {
        let node = self.nodes.get_node(node_name).await?;

        if let Some(address) = node.address_of(NodeAddressType::ExternalIP) {
            return Ok(address.to_string());
        }

        if let Some(address) = node.address_of(NodeAddressType::InternalIP) {
            info!(node = %node_name, "Node has no external address, using internal address");
            return Ok(address.to_string());
        }

        Err(AddressError::NoAddress {
            node: node_name.to_string(),
        })
    }
}
