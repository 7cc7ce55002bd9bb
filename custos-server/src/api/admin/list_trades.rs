use axum::{Json, extract::Query, response::IntoResponse};
use serde::Deserialize;

use custos_core::entities::TradeStatus;

use crate::api::extractors::AdminAuth;
use crate::api::trade_response;
use crate::state::AppState;

use super::AdminApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct ListTradesQuery {
    /// Comma-separated status names. Absent means every status.
    status: Option<String>,
}

/// `GET /trades` — list trades, optionally filtered by status.
pub async fn list_trades(
    state: axum::extract::State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<ListTradesQuery>,
) -> Result<impl IntoResponse, AdminApiError> {
    let statuses = parse_status_filter(query.status.as_deref())?;
    let trades = state.flow.list_trades(&statuses).await?;

    let response: Vec<_> = trades.iter().map(trade_response).collect();
    Ok(Json(response))
}

fn parse_status_filter(raw: Option<&str>) -> Result<Vec<TradeStatus>, AdminApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<TradeStatus>()
                .map_err(|_| AdminApiError::BadStatusFilter(part.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_filter() {
        assert_eq!(parse_status_filter(None).unwrap(), Vec::new());
        assert_eq!(
            parse_status_filter(Some("funded")).unwrap(),
            vec![TradeStatus::Funded]
        );
        assert_eq!(
            parse_status_filter(Some("funded, disputed")).unwrap(),
            vec![TradeStatus::Funded, TradeStatus::Disputed]
        );
        assert!(parse_status_filter(Some("bogus")).is_err());
    }
}
