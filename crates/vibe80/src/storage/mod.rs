//! The abstract persistence boundary. `spec.md` treats the storage
//! backend as an external collaborator and describes only its contract;
//! this trait is that contract, shaped after the operations §4.6 actually
//! needs (get/set scalars, hash fields for records, ordered lists for the
//! message log).

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>>;
    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>>;

    async fn list_push(&self, key: &str, value: Value) -> Result<()>;
    async fn list_range(&self, key: &str, start: usize, end: Option<usize>) -> Result<Vec<Value>>;
    async fn list_clear(&self, key: &str) -> Result<()>;
}

pub use memory::DashMapStorage;
