use shared::{error::ApiError, protocol::UserSummary};

use crate::{persistence, RelayContext};

/// Case-insensitive substring search over usernames and display names.
/// A blank query yields `None`: nothing is sent back.
pub async fn search_users(
    ctx: &RelayContext,
    query: &str,
) -> Result<Option<Vec<UserSummary>>, ApiError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(None);
    }
    ctx.store
        .search_users(query, ctx.settings.search_limit)
        .await
        .map(Some)
        .map_err(persistence)
}
