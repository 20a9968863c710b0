//! Targets waiting to be connected.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::Result;
use crate::multiplexer::Multiplexer;
use crate::transport::Connector;

/// Knows how to open a connection to one target.
#[derive(Clone)]
pub struct Supplier {
    uri: String,
    connector: Arc<dyn Connector>,
}

impl Supplier {
    pub fn new(uri: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            uri: uri.into(),
            connector,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn connect(&self) -> Result<Multiplexer> {
        self.connector.connect(&self.uri).await
    }
}

impl std::fmt::Debug for Supplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Supplier").field(&self.uri).finish()
    }
}

/// Suppliers not currently backing an active connection, at most one per URI.
#[derive(Debug, Default)]
pub struct Reserve {
    suppliers: Vec<Supplier>,
}

impl Reserve {
    pub fn new(suppliers: impl IntoIterator<Item = Supplier>) -> Self {
        let mut reserve = Self::default();
        reserve.reset(suppliers);
        reserve
    }

    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.suppliers.iter().any(|s| s.uri == uri)
    }

    pub fn uris(&self) -> Vec<String> {
        self.suppliers.iter().map(|s| s.uri.clone()).collect()
    }

    /// Take a random supplier out.
    pub fn take(&mut self, rng: &mut StdRng) -> Option<Supplier> {
        match self.suppliers.len() {
            0 => None,
            1 => self.suppliers.pop(),
            n => Some(self.suppliers.swap_remove(rng.gen_range(0..n))),
        }
    }

    /// Put a supplier back unless its URI is already here.
    pub fn give_back(&mut self, supplier: Supplier) -> bool {
        if self.contains(&supplier.uri) {
            return false;
        }
        self.suppliers.push(supplier);
        true
    }

    pub fn reset(&mut self, suppliers: impl IntoIterator<Item = Supplier>) {
        self.suppliers.clear();
        for supplier in suppliers {
            self.give_back(supplier);
        }
    }

    pub fn clear(&mut self) {
        self.suppliers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RSocketError;
    use async_trait::async_trait;
    use rand::SeedableRng;

    struct Refuse;

    #[async_trait]
    impl Connector for Refuse {
        async fn connect(&self, uri: &str) -> Result<Multiplexer> {
            Err(RSocketError::InvalidUri(uri.to_string()))
        }
    }

    fn supplier(uri: &str) -> Supplier {
        Supplier::new(uri, Arc::new(Refuse))
    }

    #[test]
    fn test_reserve_dedups() {
        let reserve = Reserve::new(["a", "b", "a"].map(supplier));
        assert_eq!(reserve.uris(), vec!["a", "b"]);
    }

    #[test]
    fn test_take_drains_every_uri_once() {
        let mut reserve = Reserve::new(["a", "b", "c", "d"].map(supplier));
        let mut rng = StdRng::seed_from_u64(1);
        let mut taken = Vec::new();
        while let Some(s) = reserve.take(&mut rng) {
            taken.push(s.uri().to_string());
        }
        taken.sort();
        assert_eq!(taken, vec!["a", "b", "c", "d"]);
        assert!(reserve.is_empty());
    }

    #[test]
    fn test_give_back() {
        let mut reserve = Reserve::new([supplier("a")]);
        assert!(!reserve.give_back(supplier("a")));
        assert!(reserve.give_back(supplier("b")));
        assert_eq!(reserve.len(), 2);
        reserve.reset([supplier("c")]);
        assert_eq!(reserve.uris(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_connect_goes_through_connector() {
        let err = supplier("tcp://nowhere:1").connect().await.unwrap_err();
        assert!(matches!(err, RSocketError::InvalidUri(u) if u == "tcp://nowhere:1"));
    }
}
