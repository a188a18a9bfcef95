//! Push-only agent backend.
//!
//! Agent sources receive their lines out-of-band through the ingestion
//! endpoint (see [`crate::push`]). The backend exists so those sources fit
//! the shared [`LogSource`] contract: it lists nothing and refuses reads.

use async_trait::async_trait;

use crate::error::{SourceError, SourceResult};
use crate::models::{SourceType, TargetMeta, TargetRef};
use crate::stream::ByteStream;
use crate::traits::LogSource;

pub struct AgentSource {
    id: String,
}

impl AgentSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl LogSource for AgentSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Agent
    }

    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> {
        Ok(Vec::new())
    }

    async fn open_range(
        &self,
        _target: &TargetRef,
        _start: u64,
        _end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        Err(SourceError::RangeNotSupported)
    }

    async fn open_stream(&self, _target: &TargetRef) -> SourceResult<ByteStream> {
        Err(SourceError::StreamNotSupported)
    }

    async fn stat(&self, _target: &TargetRef) -> SourceResult<TargetMeta> {
        Err(SourceError::StreamNotSupported)
    }
}
