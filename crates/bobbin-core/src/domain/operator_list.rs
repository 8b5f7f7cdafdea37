//! Operator list model: streamed drawing instructions.
//!
//! The content producer sends a page's operator list as a sequence of chunks;
//! the host appends them into one [`OperatorList`] per page and intent, and
//! render tasks execute it incrementally through a cursor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One streamed fragment of a page's operator list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorListChunk {
    pub opcodes: Vec<u32>,
    pub args: Vec<Value>,
    #[serde(default)]
    pub is_last_chunk: bool,
}

impl OperatorListChunk {
    pub fn new(opcodes: Vec<u32>, args: Vec<Value>, is_last_chunk: bool) -> Self {
        Self {
            opcodes,
            args,
            is_last_chunk,
        }
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }
}

/// Accumulated operator list.
///
/// Invariant: `opcodes.len() == args.len()`. Chunks with mismatched lengths
/// are padded with `null` args so cursors stay aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorList {
    opcodes: Vec<u32>,
    args: Vec<Value>,
    last_chunk: bool,
}

impl OperatorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: OperatorListChunk) {
        let OperatorListChunk {
            opcodes,
            mut args,
            is_last_chunk,
        } = chunk;
        args.resize(opcodes.len(), Value::Null);
        self.opcodes.extend(opcodes);
        self.args.extend(args);
        self.last_chunk = is_last_chunk;
    }

    /// No more chunks will arrive (producer closed, or the stream failed).
    pub fn mark_complete(&mut self) {
        self.last_chunk = true;
    }

    pub fn opcodes(&self) -> &[u32] {
        &self.opcodes
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.last_chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_uses_camel_case_flag() {
        let chunk: OperatorListChunk =
            serde_json::from_value(json!({"opcodes": [1, 2], "args": [null, [3]], "isLastChunk": true}))
                .unwrap();
        assert_eq!(chunk.len(), 2);
        assert!(chunk.is_last_chunk);
    }

    #[test]
    fn append_keeps_args_aligned() {
        let mut list = OperatorList::new();
        list.append(OperatorListChunk::new(vec![1, 2, 3], vec![json!(1)], false));
        assert_eq!(list.len(), 3);
        assert_eq!(list.args().len(), 3);
        assert!(!list.is_complete());

        list.append(OperatorListChunk::new(vec![4], vec![json!(4)], true));
        assert_eq!(list.opcodes(), &[1, 2, 3, 4]);
        assert!(list.is_complete());
    }
}
