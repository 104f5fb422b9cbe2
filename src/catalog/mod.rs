//! Catalog interface
//!
//! The channel/stream catalog is an external collaborator; the streaming
//! plane only ever reads channels and streams and appends one audit row
//! per ended session. This module defines that seam as a trait plus an
//! in-memory implementation used by tests and standalone deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{CatalogError, CatalogResult};
use crate::models::{Channel, SessionAuditRow, Stream};

/// Read-only catalog queries required by the streaming plane, plus the
/// single write (session audit) performed on session end.
#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn get_channel_by_id(&self, id: Uuid) -> CatalogResult<Channel>;

    async fn get_channel_by_number(&self, number: u32) -> CatalogResult<Channel>;

    /// The enabled stream currently bound to a channel.
    async fn get_stream_for_channel(&self, channel_id: Uuid) -> CatalogResult<Stream>;

    async fn get_stream_by_id(&self, id: Uuid) -> CatalogResult<Stream>;

    /// Append one audit row for a session that reached ENDED.
    async fn append_session_audit(&self, row: SessionAuditRow) -> CatalogResult<()>;
}

/// In-memory catalog. Channel numbers are kept unique on insert, matching
/// the catalog store's constraint.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryCatalogState>,
}

#[derive(Default)]
struct MemoryCatalogState {
    channels: HashMap<Uuid, Channel>,
    numbers: HashMap<u32, Uuid>,
    streams: HashMap<Uuid, Stream>,
    streams_by_channel: HashMap<Uuid, Uuid>,
    audit: Vec<SessionAuditRow>,
}

impl MemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_channel(&self, channel: Channel) -> CatalogResult<()> {
        let mut state = self.inner.write().await;
        if let Some(existing) = state.numbers.get(&channel.number) {
            if *existing != channel.id {
                return Err(CatalogError::Store(format!(
                    "channel number {} already taken",
                    channel.number
                )));
            }
        }
        state.numbers.insert(channel.number, channel.id);
        state.channels.insert(channel.id, channel);
        Ok(())
    }

    pub async fn insert_stream(&self, stream: Stream) -> CatalogResult<()> {
        let mut state = self.inner.write().await;
        state.streams_by_channel.insert(stream.channel_id, stream.id);
        state.streams.insert(stream.id, stream);
        Ok(())
    }

    /// Audit rows collected so far (test observability).
    pub async fn audit_rows(&self) -> Vec<SessionAuditRow> {
        self.inner.read().await.audit.clone()
    }
}

#[async_trait]
impl ChannelCatalog for MemoryCatalog {
    async fn get_channel_by_id(&self, id: Uuid) -> CatalogResult<Channel> {
        self.inner
            .read()
            .await
            .channels
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("channel", id))
    }

    async fn get_channel_by_number(&self, number: u32) -> CatalogResult<Channel> {
        let state = self.inner.read().await;
        state
            .numbers
            .get(&number)
            .and_then(|id| state.channels.get(id))
            .cloned()
            .ok_or_else(|| CatalogError::not_found("channel", number))
    }

    async fn get_stream_for_channel(&self, channel_id: Uuid) -> CatalogResult<Stream> {
        let state = self.inner.read().await;
        state
            .streams_by_channel
            .get(&channel_id)
            .and_then(|id| state.streams.get(id))
            .filter(|s| s.enabled)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("stream for channel", channel_id))
    }

    async fn get_stream_by_id(&self, id: Uuid) -> CatalogResult<Stream> {
        self.inner
            .read()
            .await
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found("stream", id))
    }

    async fn append_session_audit(&self, row: SessionAuditRow) -> CatalogResult<()> {
        debug!(
            session_id = %row.session_id,
            channel_id = %row.channel_id,
            bytes_forwarded = row.bytes_forwarded,
            end_reason = %row.end_reason,
            "appending session audit row"
        );
        self.inner.write().await.audit.push(row);
        Ok(())
    }
}
