//! Content-addressed object store
//!
//! Signed objects are stored under their link. Writes are idempotent: the
//! same content always lands on the same key.

use std::sync::Arc;

use crate::error::{NodeError, NodeResult};
use crate::identity::Protocol;
use crate::kv::{KeyValueStore, Sublevel};
use crate::object::Object;
use crate::types::Link;

/// Store of signed objects keyed by their link
#[derive(Clone)]
pub struct ObjectStore {
    kv: Sublevel,
    protocol: Arc<dyn Protocol>,
}

impl ObjectStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            kv: Sublevel::new(kv, "content"),
            protocol,
        }
    }

    /// Save an object and return its link
    pub fn put(&self, object: &Object) -> NodeResult<Link> {
        let link = self.protocol.link(object)?;
        if self.kv.get(link.as_bytes())?.is_none() {
            self.kv.put(link.as_bytes(), &object.to_bytes()?)?;
        }
        Ok(link)
    }

    /// Load an object by link
    pub fn get(&self, link: &Link) -> NodeResult<Object> {
        self.get_opt(link)?
            .ok_or_else(|| NodeError::NotFound(format!("object {}", link)))
    }

    pub fn get_opt(&self, link: &Link) -> NodeResult<Option<Object>> {
        match self.kv.get(link.as_bytes())? {
            Some(bytes) => Ok(Some(Object::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw stored bytes, exactly as they go over the wire
    pub fn get_bytes(&self, link: &Link) -> NodeResult<Vec<u8>> {
        self.kv
            .get(link.as_bytes())?
            .ok_or_else(|| NodeError::NotFound(format!("object {}", link)))
    }

    pub fn has(&self, link: &Link) -> NodeResult<bool> {
        Ok(self.kv.get(link.as_bytes())?.is_some())
    }

    pub fn del(&self, link: &Link) -> NodeResult<()> {
        self.kv.del(link.as_bytes())
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Ed25519Protocol;
    use crate::kv::MemoryStore;

    fn store() -> ObjectStore {
        ObjectStore::new(MemoryStore::shared(), Arc::new(Ed25519Protocol))
    }

    #[test]
    fn test_put_get_by_link() {
        let store = store();
        let object = Object::new("thang").with("a", 1);
        let link = store.put(&object).unwrap();
        assert_eq!(store.get(&link).unwrap(), object);
        assert!(store.has(&link).unwrap());
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = store();
        let object = Object::new("thang");
        assert_eq!(store.put(&object).unwrap(), store.put(&object).unwrap());
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let err = store().get(&Link::from_bytes([0; 32])).unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }
}
