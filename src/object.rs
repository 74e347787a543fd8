use serde::{Deserialize, Serialize};

/// Logical type for an uploaded image as received.
pub const ORIGINAL: &str = "original";
/// Logical type for a derived, downscaled image.
pub const THUMBNAIL: &str = "thumbnail";

/// One unit handed to a store for saving.
///
/// A plain value record: the name comes from an `IdentifierGenerator`, the
/// MIME type and logical type from the caller. Fields are private so the
/// record cannot change after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreObject {
    name: String,
    mime_type: String,
    object_type: String,
}

impl StoreObject {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        object_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            object_type: object_type.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }
}
