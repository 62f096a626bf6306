pub mod error;
pub mod types;

pub use error::{Result, StoreError};
pub use types::{
    ConfigMap, ConfigValue, Decrypter, MAX_NAME_LENGTH, NopDecrypter, ResourceChanges, UpdateInfo,
    UpdateKind, UpdateResult, is_name,
};
