use serde::{Deserialize, Serialize};

/// Per-file header sent as the first encrypted frame of every file.
///
/// `relative_path` is the directory under the receiver's destination root,
/// `/`-separated and possibly empty. `size` lets the receiver show progress
/// and detect a truncated body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub relative_path: String,
    pub size: Option<u64>,
}

impl FileHeader {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
