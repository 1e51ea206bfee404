//! Keyword-based server selection.

use std::sync::Arc;

use super::connection::ServerConnection;
use super::types::ServerDescriptor;

/// Picks the servers relevant to a query from its routing keywords.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryRouter;

impl QueryRouter {
    pub fn new() -> Self {
        Self
    }

    /// Servers whose keywords match any query keyword, in registration order.
    ///
    /// When nothing matches, every currently connected server is returned
    /// instead. Matched servers are returned whatever their state; a
    /// disconnected one gets a lazy reconnect when the query runs.
    pub fn select(
        &self,
        servers: &[Arc<ServerConnection>],
        keywords: &[String],
    ) -> Vec<Arc<ServerConnection>> {
        let needles: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let matched: Vec<Arc<ServerConnection>> = servers
            .iter()
            .filter(|conn| matches_keywords(conn.descriptor(), &needles))
            .cloned()
            .collect();

        if !matched.is_empty() {
            return matched;
        }

        let fallback: Vec<Arc<ServerConnection>> = servers
            .iter()
            .filter(|conn| conn.is_connected())
            .cloned()
            .collect();

        tracing::debug!(
            keywords = ?keywords,
            fallback = fallback.len(),
            "no keyword match, falling back to connected servers"
        );
        fallback
    }
}

/// Case-insensitive substring match of a query keyword inside a server
/// keyword, so "sponsor" hits "sponsorship". The reverse is not a match: a
/// server keyword "ai" must not claim every query mentioning "email".
/// `needles` must already be lowercased.
fn matches_keywords(descriptor: &ServerDescriptor, needles: &[String]) -> bool {
    descriptor.keywords.iter().any(|keyword| {
        let keyword = keyword.trim().to_lowercase();
        !keyword.is_empty() && needles.iter().any(|needle| keyword.contains(needle.as_str()))
    })
}
