//! Checkpoint serialization
//!
//! Backends store checkpoints as opaque byte blobs; the serializer decides
//! the wire format. JSON is the default.

use crate::checkpoint::Checkpoint;
use crate::error::Result;

/// Converts checkpoints to and from bytes for storage backends
pub trait CheckpointSerializer: Send + Sync {
    fn dumps(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>>;
    fn loads(&self, data: &[u8]) -> Result<Checkpoint>;
}

/// JSON serializer (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl CheckpointSerializer for JsonSerializer {
    fn dumps(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(checkpoint)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Checkpoint> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_json_round_trip() {
        let mut values = HashMap::new();
        values.insert("messages".to_string(), serde_json::json!([{"id": "m1"}]));
        let checkpoint = Checkpoint::new(values, Some("parent".to_string()));

        let serializer = JsonSerializer;
        let bytes = serializer.dumps(&checkpoint).unwrap();
        let restored = serializer.loads(&bytes).unwrap();

        assert_eq!(restored.id, checkpoint.id);
        assert_eq!(restored.parent_id, checkpoint.parent_id);
        assert_eq!(restored.channel_values, checkpoint.channel_values);
    }
}
