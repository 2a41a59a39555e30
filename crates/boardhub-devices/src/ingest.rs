//! Reply ingestion: MQTT message in, stream entry out.

use boardhub_storage::{EntryId, ReplyStream};

/// Appends raw reply messages to the reply stream.
///
/// No parsing happens here; the reconciler decides what a payload means.
#[derive(Clone)]
pub struct ReplyIngestor {
    stream: ReplyStream,
}

impl ReplyIngestor {
    pub fn new(stream: ReplyStream) -> Self {
        Self { stream }
    }

    /// Append one received message.
    ///
    /// Payload bytes that are not valid UTF-8 are replaced, which makes the
    /// entry fail JSON parsing downstream and get dropped there.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> boardhub_storage::Result<EntryId> {
        let payload = String::from_utf8_lossy(payload);
        let id = self.stream.append(topic, &payload).await?;
        tracing::debug!(topic, entry_id = id, bytes = payload.len(), "reply ingested");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardhub_storage::open_database;

    #[tokio::test]
    async fn test_ingest_appends_raw_payload() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("boardhub.redb")).unwrap();
        let stream = ReplyStream::new(db);
        stream.create_group("g").await.unwrap();
        let ingestor = ReplyIngestor::new(stream.clone());

        let payload = br#"{"type":"state","mac_address":"AA","value":true}"#;
        ingestor.ingest("boards/reply", payload).await.unwrap();
        ingestor.ingest("boards/reply", &[0xff, 0xfe]).await.unwrap();

        let entries = stream.read_group("g", "w0", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].topic, "boards/reply");
        assert_eq!(entries[0].payload.as_bytes(), payload);
        assert!(entries[1].payload.contains('\u{FFFD}'));
    }
}
