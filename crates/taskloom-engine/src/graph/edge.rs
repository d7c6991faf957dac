use serde::{Deserialize, Serialize};

/// A directed transition between two nodes of a session graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Edges linking `names` into a chain, in order.
    pub fn chain(names: &[&str]) -> Vec<Edge> {
        names.windows(2).map(|w| Edge::new(w[0], w[1])).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain() {
        let edges = Edge::chain(&["intake", "device", "respond"]);
        assert_eq!(
            edges,
            vec![Edge::new("intake", "device"), Edge::new("device", "respond")]
        );
        assert!(Edge::chain(&["solo"]).is_empty());
    }

    #[test]
    fn test_edge_serialization() {
        let json = serde_json::to_string(&Edge::new("a", "b")).unwrap();
        assert_eq!(json, r#"{"from":"a","to":"b"}"#);
    }
}
