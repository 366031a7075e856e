//! Where decoded point values go.

use tokio::sync::mpsc;
use tracing::info;

use crate::error::SimError;
use crate::model::PointValue;
use crate::storage::StorageHandle;

/// Destination for the collector's handler pipeline: the asynchronous
/// storage sink, an in-process channel for embedding, or a plain log
/// line when storage is disabled.
#[derive(Clone)]
pub enum PointSink {
    Log,
    Storage(StorageHandle),
    Channel(mpsc::Sender<PointValue>),
}

impl PointSink {
    pub async fn handle(&self, value: PointValue) -> Result<(), SimError> {
        match self {
            PointSink::Log => {
                info!(
                    server_id = %value.server_id,
                    device_id = %value.device_id,
                    point = %value.point_name,
                    address = value.address,
                    unit = %value.unit,
                    "value {}",
                    value.value
                );
                Ok(())
            }
            PointSink::Storage(handle) => handle.handle(value).await,
            PointSink::Channel(tx) => tx.send(value).await.map_err(|_| SimError::Cancelled),
        }
    }
}
